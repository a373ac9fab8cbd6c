use anyhow::{anyhow, Context, Result};
use std::process::Command;

use super::Gate;

/// Runs an external program on each transition, e.g.
/// `["nft", "add", "element", "inet", "fw4", "allow", "{ 10.0.0.2 }"]`.
#[derive(Debug, Clone)]
pub struct CommandGate {
    open: Vec<String>,
    close: Vec<String>,
}

impl CommandGate {
    pub fn new(open: Vec<String>, close: Vec<String>) -> Self {
        Self { open, close }
    }
}

fn run(argv: &[String]) -> Result<()> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("spawn {}", program))?;
    if !status.success() {
        return Err(anyhow!("{} exited with {}", program, status));
    }
    Ok(())
}

impl Gate for CommandGate {
    fn name(&self) -> &'static str {
        "command"
    }

    fn initialize(&mut self) -> Result<()> {
        if self.open.is_empty() || self.close.is_empty() {
            return Err(anyhow!("open and close commands required"));
        }
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        run(&self.open)
    }

    fn close(&mut self) -> Result<()> {
        run(&self.close)
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
