//! OS connection table access via `netstat -an`
//!
//! The parser understands the Windows, Linux and BSD/macOS output layouts:
//!
//! ```text
//! TCP    10.0.0.5:51000         93.184.216.34:443      ESTABLISHED
//! tcp        0      0 10.0.0.5:51000          93.184.216.34:443       ESTABLISHED
//! tcp4       0      0  10.0.0.5.51000         93.184.216.34.443       ESTABLISHED
//! ```

use crate::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::process::Command;
use tracing::trace;

/// One row of the TCP connection table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRow {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: String,
}

impl ConnectionRow {
    pub fn is_established(&self) -> bool {
        self.state.eq_ignore_ascii_case("ESTABLISHED")
    }
}

/// Source of TCP connection table snapshots
#[async_trait]
pub trait ConnectionTable: Send + Sync {
    async fn query(&self) -> CaptureResult<Vec<ConnectionRow>>;
}

/// Connection table read by running `netstat -an`
#[derive(Debug, Default, Clone)]
pub struct NetstatTable;

#[async_trait]
impl ConnectionTable for NetstatTable {
    async fn query(&self) -> CaptureResult<Vec<ConnectionRow>> {
        let output = Command::new("netstat")
            .arg("-an")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CaptureError::PollQueryFailure(format!("failed to run netstat: {}", e)))?;

        if !output.status.success() {
            return Err(CaptureError::PollQueryFailure(format!(
                "netstat exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rows = parse_netstat(&stdout);
        trace!("netstat reported {} TCP rows", rows.len());
        Ok(rows)
    }
}

/// Parse `netstat -an` output into TCP rows, skipping anything unrecognized
pub fn parse_netstat(output: &str) -> Vec<ConnectionRow> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ConnectionRow> {
    let mut tokens = line.split_whitespace();

    let proto = tokens.next()?;
    if !proto.to_ascii_lowercase().starts_with("tcp") {
        return None;
    }

    // queue counters come before the endpoints on Unix layouts
    let mut tokens = tokens.skip_while(|t| parse_endpoint(t).is_none());
    let local = parse_endpoint(tokens.next()?)?;
    let remote = parse_endpoint(tokens.next()?)?;
    let state = tokens.next()?.to_string();

    Some(ConnectionRow {
        local,
        remote,
        state,
    })
}

fn parse_endpoint(token: &str) -> Option<SocketAddr> {
    if let Ok(addr) = token.parse::<SocketAddr>() {
        return Some(addr);
    }

    [':', '.']
        .iter()
        .find_map(|sep| split_endpoint(token, *sep))
}

fn split_endpoint(token: &str, sep: char) -> Option<SocketAddr> {
    let (host, port) = token.rsplit_once(sep)?;
    let port = port.parse::<u16>().ok()?;
    let host = host.split('%').next()?;
    let ip = host.parse::<IpAddr>().ok()?;
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(a)), port)
    }

    #[test]
    fn test_windows_layout() {
        let output = "\
Active Connections

  Proto  Local Address          Foreign Address        State
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING
  TCP    10.0.0.5:51000         93.184.216.34:443      ESTABLISHED
  TCP    [::1]:49670            [::1]:49671            ESTABLISHED
  UDP    0.0.0.0:5353           *:*
";
        let rows = parse_netstat(output);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].local, v4([10, 0, 0, 5], 51000));
        assert_eq!(rows[1].remote, v4([93, 184, 216, 34], 443));
        assert!(rows[1].is_established());
        assert!(!rows[0].is_established());
        assert!(rows[2].local.ip().is_loopback());
    }

    #[test]
    fn test_linux_layout() {
        let output = "\
Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
tcp        0     36 192.168.1.20:22         192.168.1.7:50522       ESTABLISHED
tcp6       0      0 ::ffff:10.0.0.5:8080    ::ffff:10.0.0.9:41000   ESTABLISHED
udp        0      0 0.0.0.0:68              0.0.0.0:*
";
        let rows = parse_netstat(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].local, v4([192, 168, 1, 20], 22));
        assert_eq!(rows[0].remote, v4([192, 168, 1, 7], 50522));
        assert_eq!(rows[0].state, "ESTABLISHED");
        assert_eq!(rows[1].local.port(), 8080);
    }

    #[test]
    fn test_bsd_layout() {
        let output = "\
Active Internet connections (including servers)
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)
tcp4       0      0  10.0.0.5.51000         93.184.216.34.443      ESTABLISHED
tcp6       0      0  fe80::1%lo0.49152      fe80::1%lo0.631        ESTABLISHED
tcp4       0      0  *.22                   *.*                    LISTEN
";
        let rows = parse_netstat(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].local, v4([10, 0, 0, 5], 51000));
        assert_eq!(rows[0].remote, v4([93, 184, 216, 34], 443));
        assert_eq!(rows[1].remote.port(), 631);
    }

    #[test]
    fn test_garbage_is_skipped() {
        assert!(parse_netstat("").is_empty());
        assert!(parse_netstat("tcp\ntcp 0 0\nTCP a:b c:d ESTABLISHED").is_empty());
    }
}
