//! Firewall arbiter: per-VM allow rules toward a declared C2 address.
//!
//! The host bootstrap owns two nftables tables (`lab_nat` with a
//! `prerouting` chain, `lab_flt` with a `forward` chain); bottle only
//! inserts and deletes accept rules inside them. Every rule carries an
//! `allow:<vmIP>-><dstIP>` comment that doubles as the ownership token:
//! cleanup deletes by comment handle and never touches rules it did not
//! introduce.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::host::{CommandError, CommandOutput, CommandRunner};

/// family / table / chain triples the arbiter augments.
const CHAINS: [(&str, &str, &str); 2] = [
    ("ip", "lab_nat", "prerouting"),
    ("ip", "lab_flt", "forward"),
];

#[derive(thiserror::Error, Debug)]
pub enum FirewallError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("lease carries no vm_ip metadata")]
    MissingVmIp,

    #[error("nft {args}: {stderr}")]
    Nft { args: String, stderr: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// One allow pair currently present in the chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistRule {
    pub vm_ip: String,
    pub dest_ip: String,
}

/// Handle returned by `whitelist`. Removing it deletes only the rules
/// that call introduced; a no-op cleanup is returned when the pair was
/// already present in both chains.
pub struct WhitelistCleanup {
    runner: Arc<dyn CommandRunner>,
    comment: String,
    owned_chains: Vec<(&'static str, &'static str, &'static str)>,
}

impl std::fmt::Debug for WhitelistCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhitelistCleanup")
            .field("comment", &self.comment)
            .field("owned_chains", &self.owned_chains)
            .finish()
    }
}

impl WhitelistCleanup {
    pub fn is_noop(&self) -> bool {
        self.owned_chains.is_empty()
    }

    /// Delete the rules this whitelist call added, resolving their
    /// current handles by comment. Rules added by other callers keep
    /// their own comment-scoped lifetime.
    pub async fn remove(self) -> Result<(), FirewallError> {
        for &(family, table, chain) in &self.owned_chains {
            let listing = nft(
                &self.runner,
                &["-a", "list", "chain", family, table, chain],
            )
            .await?;
            for line in listing.stdout_string().lines() {
                if !line.contains(&format!("\"{}\"", self.comment)) {
                    continue;
                }
                let Some(handle) = parse_handle(line) else {
                    continue;
                };
                nft(
                    &self.runner,
                    &[
                        "delete", "rule", family, table, chain, "handle", &handle.to_string(),
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }
}

pub struct FirewallArbiter {
    runner: Arc<dyn CommandRunner>,
}

impl FirewallArbiter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Allow traffic from `vm_ip` to `dest` in both chains.
    pub async fn whitelist(
        &self,
        vm_ip: &str,
        dest: &str,
    ) -> Result<WhitelistCleanup, FirewallError> {
        let dest: Ipv4Addr = dest
            .parse()
            .map_err(|_| FirewallError::InvalidAddress(dest.to_string()))?;
        let vm: Ipv4Addr = vm_ip
            .parse()
            .map_err(|_| FirewallError::InvalidAddress(vm_ip.to_string()))?;

        let comment = format!("allow:{vm}->{dest}");
        let mut owned = Vec::new();

        for (family, table, chain) in CHAINS {
            let listing = nft(&self.runner, &["-a", "list", "chain", family, table, chain]).await?;
            if listing
                .stdout_string()
                .lines()
                .any(|l| l.contains(&format!("\"{comment}\"")))
            {
                continue;
            }

            nft(
                &self.runner,
                &[
                    "insert", "rule", family, table, chain,
                    "ip", "saddr", &vm.to_string(),
                    "ip", "daddr", &dest.to_string(),
                    "counter", "accept",
                    "comment", &format!("\"{comment}\""),
                ],
            )
            .await?;
            owned.push((family, table, chain));
        }

        if owned.is_empty() {
            tracing::debug!(%comment, "whitelist rules already present, cleanup is a no-op");
        } else {
            tracing::info!(vm = %vm, dest = %dest, "installed firewall whitelist");
        }

        Ok(WhitelistCleanup {
            runner: self.runner.clone(),
            comment,
            owned_chains: owned,
        })
    }

    /// All allow pairs currently present in either chain.
    pub async fn list(&self) -> Result<Vec<WhitelistRule>, FirewallError> {
        let listings = futures::future::try_join_all(CHAINS.iter().map(|&(family, table, chain)| {
            let runner = self.runner.clone();
            async move { nft(&runner, &["-a", "list", "chain", family, table, chain]).await }
        }))
        .await?;

        let mut rules = Vec::new();
        for listing in listings {
            for line in listing.stdout_string().lines() {
                if let Some(rule) = parse_rule_line(line) {
                    if !rules.contains(&rule) {
                        rules.push(rule);
                    }
                }
            }
        }
        Ok(rules)
    }

    /// Create the two tables and chains the arbiter augments. Intended
    /// for `bottle setup`; the wider host bootstrap stays external.
    pub async fn ensure_tables(&self) -> Result<(), FirewallError> {
        for (family, table, chain, hook, prio) in [
            ("ip", "lab_nat", "prerouting", "prerouting", "-100"),
            ("ip", "lab_flt", "forward", "forward", "0"),
        ] {
            nft(&self.runner, &["add", "table", family, table]).await?;
            let chain_spec = format!(
                "{{ type {} hook {} priority {} ; policy accept ; }}",
                if table == "lab_nat" { "nat" } else { "filter" },
                hook,
                prio
            );
            nft(
                &self.runner,
                &["add", "chain", family, table, chain, &chain_spec],
            )
            .await?;
        }
        Ok(())
    }

    /// Delete the two tables. Missing tables are not an error.
    pub async fn clear_tables(&self) -> Result<(), FirewallError> {
        for (family, table, _) in CHAINS {
            match nft(&self.runner, &["delete", "table", family, table]).await {
                Ok(_) => {}
                Err(FirewallError::Nft { stderr, .. })
                    if stderr.contains("No such file or directory") => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The single nft invocation helper; test doubles replace the runner
/// underneath it wholesale.
async fn nft(
    runner: &Arc<dyn CommandRunner>,
    args: &[&str],
) -> Result<CommandOutput, FirewallError> {
    let out = runner.run("nft", args).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(FirewallError::Nft {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

/// Parse one chain listing line into an allow pair. Lines without the
/// ownership comment are not ours and yield `None`.
pub fn parse_rule_line(line: &str) -> Option<WhitelistRule> {
    let start = line.find("comment \"allow:")? + "comment \"".len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    let token = &rest[..end];
    let pair = token.strip_prefix("allow:")?;
    let (vm, dest) = pair.split_once("->")?;
    let _: Ipv4Addr = vm.parse().ok()?;
    let _: Ipv4Addr = dest.parse().ok()?;
    Some(WhitelistRule {
        vm_ip: vm.to_string(),
        dest_ip: dest.to_string(),
    })
}

fn parse_handle(line: &str) -> Option<u64> {
    let pos = line.rfind("# handle ")?;
    line[pos + "# handle ".len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}
