//! `myinjector diff <staged>`: preview a staged config document.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use myinjector_sync::diff_staged;

use super::Env;

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Staged config document to compare against the live one.
    pub staged: PathBuf,
}

impl DiffArgs {
    pub fn run(self, env: &Env) -> Result<()> {
        let current = env.engine().document();
        let diff = diff_staged(&current, &self.staged)
            .with_context(|| format!("diff failed for {}", self.staged.display()))?;

        if !diff.changed {
            println!("No differences for {}.", diff.staged_path.display());
            return Ok(());
        }

        print!("{}", diff.unified_diff);
        if !diff.unified_diff.ends_with('\n') {
            println!();
        }
        Ok(())
    }
}
