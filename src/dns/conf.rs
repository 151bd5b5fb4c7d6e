//! `/etc/resolv.conf`-style parsing. Only `nameserver` lines are consumed,
//! as specified. A pure function over a `&str` so it is unit-testable
//! without real file I/O; [`watch`] wires it up to a filesystem watcher
//! for the live resolver.

use std::net::IpAddr;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver};

use notify::{RecursiveMode, Watcher};

pub const DNS_PORT: u16 = 53;

/// Parses `nameserver <ip>` lines, ignoring everything else (comments,
/// `search`/`domain`/`options` directives, malformed addresses).
pub fn parse(text: &str) -> Vec<IpAddr> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|addr| addr.parse::<IpAddr>().ok())
        .collect()
}

/// Reads and parses the given path, returning an empty server list (not an
/// error) if the file is unreadable — the resolver simply has no servers
/// to query until one reappears.
pub fn load(path: &Path) -> Vec<IpAddr> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse(&text),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read resolver config");
            Vec::new()
        }
    }
}

/// Starts watching `path` for changes, delivering a unit notification on
/// the returned channel each time the file is rewritten. The caller
/// re-reads and replaces its server list on receipt — a single assignment
/// between loop iterations, so readers never see a partially-updated set.
pub fn watch(path: &Path) -> notify::Result<(notify::RecommendedWatcher, Receiver<()>)> {
    let (tx, rx) = channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nameserver_lines_only() {
        let text = "\
domain example.com
nameserver 203.0.113.53
# a comment
nameserver 2001:db8::53
options timeout:1
";
        let servers = parse(text);
        assert_eq!(
            servers,
            vec![
                "203.0.113.53".parse::<IpAddr>().unwrap(),
                "2001:db8::53".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn ignores_malformed_addresses() {
        let servers = parse("nameserver not-an-ip\nnameserver 192.0.2.1\n");
        assert_eq!(servers, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
    }
}
