//! Subprocess host backend.
//!
//! Fallback for hosts where the raw netlink path is unavailable. Every
//! invocation passes an argv vector to `ip` / `iptables` directly — no
//! shell, no string interpolation of caller data into a command line.

use std::net::IpAddr;
use std::process::Command;

use magic_common::types::FlowTuple;
use tracing::debug;

use super::netlink;
use super::{HostBackend, HostError, HostResult};

/// The mangle chain holding every MAGIC classifier rule.
pub const MARK_CHAIN: &str = "MAGIC_MARK";

struct CmdOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

fn run(op: &'static str, program: &str, args: &[&str]) -> Result<CmdOutput, HostError> {
    debug!(op, program, ?args, "host command");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| HostError::Failed {
            op,
            stderr: format!("cannot run {program}: {e}"),
        })?;
    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn interpret(op: &'static str, iface: Option<&str>, out: CmdOutput, deleting: bool) -> HostResult {
    if out.success {
        return Ok(());
    }
    let stderr = out.stderr.trim();
    // Idempotence: converging to the target state is success.
    if !deleting && stderr.contains("File exists") {
        return Ok(());
    }
    if deleting
        && (stderr.contains("No such file or directory")
            || stderr.contains("No such process")
            || stderr.contains("does not exist")
            || stderr.contains("No chain/target/match")
            || stderr.contains("Bad rule"))
    {
        return Ok(());
    }
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        return Err(HostError::Permission { op });
    }
    if stderr.contains("Cannot find device") {
        return Err(HostError::NoSuchInterface {
            op,
            iface: iface.unwrap_or("?").to_string(),
        });
    }
    Err(HostError::Failed {
        op,
        stderr: stderr.to_string(),
    })
}

/// Make sure the MAGIC chain exists and is jumped to from PREROUTING.
fn ensure_chain(op: &'static str) -> HostResult {
    let _ = run(op, "iptables", &["-t", "mangle", "-N", MARK_CHAIN]);
    let check = run(
        op,
        "iptables",
        &["-t", "mangle", "-C", "PREROUTING", "-j", MARK_CHAIN],
    )?;
    if !check.success {
        let out = run(
            op,
            "iptables",
            &["-t", "mangle", "-I", "PREROUTING", "1", "-j", MARK_CHAIN],
        )?;
        return interpret(op, None, out, false);
    }
    Ok(())
}

/// Apply `verb` (`-A` or `-D`) with `rule_args` inside the MAGIC chain,
/// check-first so repeated adds converge.
pub(super) fn iptables(op: &'static str, verb: &str, rule_args: &[&str]) -> HostResult {
    if verb == "-A" {
        ensure_chain(op)?;
        let mut check: Vec<&str> = vec!["-t", "mangle", "-C", MARK_CHAIN];
        check.extend_from_slice(rule_args);
        if run(op, "iptables", &check)?.success {
            return Ok(());
        }
    }
    let mut args: Vec<&str> = vec!["-t", "mangle", verb, MARK_CHAIN];
    args.extend_from_slice(rule_args);
    let out = run(op, "iptables", &args)?;
    interpret(op, None, out, verb == "-D")
}

/// Delete every MAGIC-chain rule mentioning `ip`, by replaying the listing.
pub(super) fn iptables_remove_for_ip(op: &'static str, ip: IpAddr) -> HostResult {
    let listing = run(op, "iptables", &["-t", "mangle", "-S", MARK_CHAIN])?;
    if !listing.success {
        // Chain absent: nothing to remove.
        return Ok(());
    }
    let needle = ip.to_string();
    for line in listing.stdout.lines() {
        if !line.contains(&needle) {
            continue;
        }
        let Some(spec) = line.strip_prefix(&format!("-A {MARK_CHAIN} ")) else {
            continue;
        };
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        let mut args: Vec<&str> = vec!["-t", "mangle", "-D", MARK_CHAIN];
        args.extend_from_slice(&tokens);
        let out = run(op, "iptables", &args)?;
        interpret(op, None, out, true)?;
    }
    Ok(())
}

/// Host backend shelling out to the iproute2 / iptables binaries.
#[derive(Default)]
pub struct ShellHost;

impl ShellHost {
    pub fn new() -> Self {
        ShellHost
    }
}

impl HostBackend for ShellHost {
    fn ensure_interface_up(&mut self, iface: &str) -> HostResult {
        const OP: &str = "ensure_interface_up";
        let out = run(OP, "ip", &["link", "set", iface, "up"])?;
        interpret(OP, Some(iface), out, false)
    }

    fn ensure_interface_down(&mut self, iface: &str) -> HostResult {
        const OP: &str = "ensure_interface_down";
        let out = run(OP, "ip", &["link", "set", iface, "down"])?;
        interpret(OP, Some(iface), out, false)
    }

    fn assign_addr(&mut self, iface: &str, cidr: &str) -> HostResult {
        const OP: &str = "assign_addr";
        let out = run(OP, "ip", &["addr", "replace", cidr, "dev", iface])?;
        interpret(OP, Some(iface), out, false)
    }

    fn flush_addrs(&mut self, iface: &str) -> HostResult {
        const OP: &str = "flush_addrs";
        let out = run(OP, "ip", &["addr", "flush", "dev", iface])?;
        interpret(OP, Some(iface), out, true)
    }

    fn set_default_via(&mut self, table: u32, gateway: Option<IpAddr>, dev: &str) -> HostResult {
        const OP: &str = "set_default_via";
        let table_str = table.to_string();
        let out = match gateway {
            Some(gw) => {
                let gw_str = gw.to_string();
                run(
                    OP,
                    "ip",
                    &[
                        "route", "replace", "default", "via", &gw_str, "dev", dev, "table",
                        &table_str,
                    ],
                )?
            }
            None => run(
                OP,
                "ip",
                &["route", "replace", "default", "dev", dev, "table", &table_str],
            )?,
        };
        interpret(OP, Some(dev), out, false)
    }

    fn add_route(
        &mut self,
        table: u32,
        prefix: &str,
        via: Option<IpAddr>,
        dev: &str,
    ) -> HostResult {
        const OP: &str = "add_route";
        let table_str = table.to_string();
        let out = match via {
            Some(gw) => {
                let gw_str = gw.to_string();
                run(
                    OP,
                    "ip",
                    &[
                        "route", "replace", prefix, "via", &gw_str, "dev", dev, "table",
                        &table_str,
                    ],
                )?
            }
            None => run(
                OP,
                "ip",
                &["route", "replace", prefix, "dev", dev, "table", &table_str],
            )?,
        };
        interpret(OP, Some(dev), out, false)
    }

    fn del_route(&mut self, table: u32, prefix: &str) -> HostResult {
        const OP: &str = "del_route";
        let table_str = table.to_string();
        let out = run(OP, "ip", &["route", "del", prefix, "table", &table_str])?;
        interpret(OP, None, out, true)
    }

    fn add_fwmark_rule(&mut self, mark: u32, table: u32, priority: u32) -> HostResult {
        const OP: &str = "add_fwmark_rule";
        // `ip rule add` happily duplicates; probe the listing first.
        let listing = run(OP, "ip", &["rule", "show"])?;
        let probe = format!("fwmark {mark:#x} lookup {table}");
        if listing.stdout.contains(&probe) {
            return Ok(());
        }
        let mark_str = mark.to_string();
        let table_str = table.to_string();
        let prio_str = priority.to_string();
        let out = run(
            OP,
            "ip",
            &[
                "rule", "add", "fwmark", &mark_str, "table", &table_str, "priority", &prio_str,
            ],
        )?;
        interpret(OP, None, out, false)
    }

    fn del_fwmark_rule(&mut self, mark: u32) -> HostResult {
        const OP: &str = "del_fwmark_rule";
        let mark_str = mark.to_string();
        let out = run(OP, "ip", &["rule", "del", "fwmark", &mark_str])?;
        interpret(OP, None, out, true)
    }

    fn create_blackhole_table(&mut self, table: u32) -> HostResult {
        const OP: &str = "create_blackhole_table";
        let table_str = table.to_string();
        let out = run(
            OP,
            "ip",
            &["route", "replace", "blackhole", "default", "table", &table_str],
        )?;
        interpret(OP, None, out, false)
    }

    fn mark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult {
        let mark = fwmark.to_string();
        let src = ip.to_string();
        let mut args: Vec<&str> = vec!["-s", &src];
        if let Some(dest) = dest_prefix {
            args.extend_from_slice(&["-d", dest]);
        }
        args.extend_from_slice(&["-j", "MARK", "--set-mark", &mark]);
        iptables("mark_src", "-A", &args)
    }

    fn unmark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult {
        let mark = fwmark.to_string();
        let src = ip.to_string();
        let mut args: Vec<&str> = vec!["-s", &src];
        if let Some(dest) = dest_prefix {
            args.extend_from_slice(&["-d", dest]);
        }
        args.extend_from_slice(&["-j", "MARK", "--set-mark", &mark]);
        iptables("unmark_src", "-D", &args)
    }

    fn mark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult {
        netlink::iptables_flow_rule("mark_flow", "-A", flow, fwmark)
    }

    fn unmark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult {
        netlink::iptables_flow_rule("unmark_flow", "-D", flow, fwmark)
    }

    fn connmark_pair_add(&mut self, ip: IpAddr, mark: u32) -> HostResult {
        let hex = format!("{mark:#x}");
        let addr = ip.to_string();
        iptables(
            "connmark_pair_add",
            "-A",
            &["-s", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )?;
        iptables(
            "connmark_pair_add",
            "-A",
            &["-d", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )
    }

    fn connmark_pair_del(&mut self, ip: IpAddr, mark: u32) -> HostResult {
        let hex = format!("{mark:#x}");
        let addr = ip.to_string();
        iptables(
            "connmark_pair_del",
            "-D",
            &["-s", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )?;
        iptables(
            "connmark_pair_del",
            "-D",
            &["-d", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )
    }

    fn restore_conn_mark_on_ingress(&mut self) -> HostResult {
        iptables(
            "restore_conn_mark_on_ingress",
            "-A",
            &["-j", "CONNMARK", "--restore-mark"],
        )
    }

    fn remove_classifiers_for(&mut self, ip: IpAddr) -> HostResult {
        iptables_remove_for_ip("remove_classifiers_for", ip)
    }

    fn enable_conntrack_accounting(&mut self) -> HostResult {
        const OP: &str = "enable_conntrack_accounting";
        if std::fs::write("/proc/sys/net/netfilter/nf_conntrack_acct", "1").is_ok() {
            return Ok(());
        }
        let out = run(OP, "sysctl", &["-w", "net.netfilter.nf_conntrack_acct=1"])?;
        interpret(OP, None, out, false)
    }
}
