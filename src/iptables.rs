//! Manages the iptables rule diverting container traffic to our queue.

use std::process::Command;

use anyhow::{Context, Result, bail};
use log::{debug, info};

/// `-j NFQUEUE` rule at the top of the given chain. Install and remove are
/// idempotent, so a crashed previous run does not leave duplicates behind.
pub struct NfqueueRule {
    chain: String,
    queue_num: u16,
}

impl NfqueueRule {
    pub fn new(chain: impl Into<String>, queue_num: u16) -> Self {
        NfqueueRule {
            chain: chain.into(),
            queue_num,
        }
    }

    pub fn install(&self) -> Result<()> {
        if self.exists()? {
            debug!("NFQUEUE rule already present in {}", self.chain);
            return Ok(());
        }
        self.run("-I", true)?;
        info!("diverting {} to queue {}", self.chain, self.queue_num);
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if !self.exists()? {
            debug!("NFQUEUE rule already absent from {}", self.chain);
            return Ok(());
        }
        self.run("-D", false)?;
        info!("restored {}", self.chain);
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        let status = Command::new("iptables")
            .args(self.rule_args("-C", false))
            .status()
            .context("running iptables")?;
        Ok(status.success())
    }

    fn run(&self, action: &str, at_top: bool) -> Result<()> {
        let output = Command::new("iptables")
            .args(self.rule_args(action, at_top))
            .output()
            .context("running iptables")?;
        if !output.status.success() {
            bail!(
                "iptables {action} {} failed: {}",
                self.chain,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn rule_args(&self, action: &str, at_top: bool) -> Vec<String> {
        let mut args = vec![action.to_owned(), self.chain.clone()];
        if at_top {
            args.push("1".to_owned());
        }
        args.extend(
            ["-p", "all", "-j", "NFQUEUE", "--queue-num"]
                .into_iter()
                .map(str::to_owned),
        );
        args.push(self.queue_num.to_string());
        args
    }
}
