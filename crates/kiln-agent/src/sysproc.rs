use std::time::Duration;

use tokio::process::Command;

/// Fixed entry-point filename every managed workload launches through.
/// Path-based discovery requires it in the command line to avoid killing
/// unrelated processes that merely mention the workload folder.
pub const ENTRY_POINT: &str = "main.py";

async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    // A missing or failing system utility degrades to "could not
    // determine", never to an error.
    let out = Command::new(program).args(args).output().await.ok()?;
    Some(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Parse `netstat -ano` output: TCP rows whose local address ends in the
/// port and whose state is LISTENING carry the owning PID in the trailing
/// column.
#[cfg(any(windows, test))]
fn parse_netstat_pid(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [proto, local, _remote, state, pid] = cols.as_slice() else {
            continue;
        };
        if !proto.eq_ignore_ascii_case("tcp") {
            continue;
        }
        if !local.ends_with(&suffix) || !state.eq_ignore_ascii_case("listening") {
            continue;
        }
        if let Ok(pid) = pid.parse::<u32>() {
            return Some(pid);
        }
    }
    None
}

/// Parse `lsof -t` output: one PID per line; empty output means the port
/// is free.
#[cfg(any(not(windows), test))]
fn parse_lsof_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

/// Parse `ps -axww -o pid=,command=` output: PID first, command line
/// after. First match wins; no secondary ranking (known limitation).
#[cfg(any(not(windows), test))]
fn parse_ps_pid(output: &str, entry_point: &str, fragment: &str) -> Option<u32> {
    for line in output.lines() {
        let line = line.trim_start();
        let Some((pid, command)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        if !command.contains(entry_point) || !command.contains(fragment) {
            continue;
        }
        if let Ok(pid) = pid.parse::<u32>() {
            return Some(pid);
        }
    }
    None
}

/// Parse `wmic process get CommandLine,ProcessId` output: command line
/// first, PID in the trailing column.
#[cfg(any(windows, test))]
fn parse_wmic_pid(output: &str, entry_point: &str, fragment: &str) -> Option<u32> {
    for line in output.lines() {
        let line = line.trim_end();
        if !line.contains(entry_point) || !line.contains(fragment) {
            continue;
        }
        let Some(pid) = line.rsplit(char::is_whitespace).next() else {
            continue;
        };
        if let Ok(pid) = pid.parse::<u32>() {
            return Some(pid);
        }
    }
    None
}

/// PID of the process listening on the TCP port, or `None` when the port
/// is free or the query could not run.
#[cfg(windows)]
pub async fn find_pid_by_port(port: u16) -> Option<u32> {
    let out = command_stdout("netstat", &["-ano"]).await?;
    parse_netstat_pid(&out, port)
}

#[cfg(not(windows))]
pub async fn find_pid_by_port(port: u16) -> Option<u32> {
    let spec = format!("TCP:{port}");
    let out = command_stdout("lsof", &["-t", "-i", &spec, "-sTCP:LISTEN"]).await?;
    parse_lsof_pid(&out)
}

/// First PID whose command line contains both the entry-point filename
/// and the path fragment. Fallback for workloads that released their port
/// but kept running.
#[cfg(windows)]
pub async fn find_pid_by_path(fragment: &str) -> Option<u32> {
    let out = command_stdout("wmic", &["process", "get", "CommandLine,ProcessId"]).await?;
    parse_wmic_pid(&out, ENTRY_POINT, fragment)
}

#[cfg(not(windows))]
pub async fn find_pid_by_path(fragment: &str) -> Option<u32> {
    let out = command_stdout("ps", &["-axww", "-o", "pid=,command="]).await?;
    parse_ps_pid(&out, ENTRY_POINT, fragment)
}

/// Forceful termination. Returns false (never errors) on failure so
/// callers can try the next strategy.
#[cfg(windows)]
pub async fn kill(pid: u32) -> bool {
    let pid = pid.to_string();
    match Command::new("taskkill")
        .args(["/F", "/PID", &pid])
        .output()
        .await
    {
        Ok(out) => out.status.success(),
        Err(_) => false,
    }
}

#[cfg(not(windows))]
pub async fn kill(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 }
}

/// Poll until nothing listens on the port. A stop that "succeeds" only
/// guarantees the kill signal was issued; callers needing confirmation
/// use this.
pub async fn wait_until_port_free(port: u16, interval: Duration, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if find_pid_by_port(port).await.is_none() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETSTAT: &str = "\
Active Connections\n\
\n\
  Proto  Local Address          Foreign Address        State           PID\n\
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1032\n\
  TCP    127.0.0.1:9001         0.0.0.0:0              LISTENING       4711\n\
  TCP    127.0.0.1:9001         127.0.0.1:52114        ESTABLISHED     4711\n\
  UDP    0.0.0.0:5353           *:*                                    2044\n";

    #[test]
    fn netstat_extracts_listening_pid() {
        assert_eq!(parse_netstat_pid(NETSTAT, 9001), Some(4711));
    }

    #[test]
    fn netstat_ignores_established_and_other_ports() {
        assert_eq!(parse_netstat_pid(NETSTAT, 52114), None);
        assert_eq!(parse_netstat_pid(NETSTAT, 9002), None);
    }

    #[test]
    fn netstat_does_not_match_port_prefixes() {
        // :9001 must not match :90011.
        let out = "  TCP    127.0.0.1:90011        0.0.0.0:0              LISTENING       77\n";
        assert_eq!(parse_netstat_pid(out, 9001), None);
    }

    #[test]
    fn netstat_tolerates_empty_and_garbage_output() {
        assert_eq!(parse_netstat_pid("", 9001), None);
        assert_eq!(parse_netstat_pid("command not found", 9001), None);
    }

    #[test]
    fn lsof_takes_first_pid() {
        assert_eq!(parse_lsof_pid("4711\n4712\n"), Some(4711));
        assert_eq!(parse_lsof_pid(""), None);
    }

    #[test]
    fn ps_requires_entry_point_and_fragment() {
        let out = "\
  101 /usr/bin/python3 /opt/workloads/demo/main.py --port 9001\n\
  102 /usr/bin/python3 /opt/other/tool.py /opt/workloads/demo\n\
  103 vim /opt/workloads/demo/main.py\n";
        assert_eq!(parse_ps_pid(out, "main.py", "/opt/workloads/demo"), Some(101));
        assert_eq!(parse_ps_pid(out, "main.py", "/opt/workloads/zzz"), None);
    }

    #[test]
    fn ps_first_match_wins() {
        let out = "\
  200 python3 /srv/demo/main.py\n\
  201 python3 /srv/demo/main.py\n";
        assert_eq!(parse_ps_pid(out, "main.py", "/srv/demo"), Some(200));
    }

    #[test]
    fn wmic_extracts_trailing_pid() {
        let out = "\
CommandLine                                                        ProcessId\n\
C:\\python\\python.exe C:\\workloads\\demo\\main.py --port 9001     5120\n\
C:\\Windows\\system32\\svchost.exe -k netsvcs                       820\n";
        assert_eq!(parse_wmic_pid(out, "main.py", "C:\\workloads\\demo"), Some(5120));
        assert_eq!(parse_wmic_pid(out, "main.py", "C:\\workloads\\zzz"), None);
    }

    #[test]
    fn wmic_skips_header_row() {
        let out = "CommandLine  ProcessId\n";
        assert_eq!(parse_wmic_pid(out, "main.py", "demo"), None);
    }
}
