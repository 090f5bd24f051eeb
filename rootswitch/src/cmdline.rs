// ABOUTME: Kernel command line inspection.
// ABOUTME: Decides whether host extensions are disabled for this boot.

/// Token fragment that marks an emergency boot.
const EMERGENCY: &str = "emergency";

/// Split the kernel command line the way the kernel does.
///
/// Whitespace inside double quotes is literal and there is no escaping, so a
/// literal double quote cannot appear in a value.
pub fn split_cmdline(cmdline: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;

    cmdline
        .split(move |c: char| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            !in_quotes && c.is_ascii_whitespace()
        })
        .filter(|item| !item.is_empty())
}

/// True when any token mentions an emergency boot or the opt-out `marker`.
/// An empty `marker` never matches.
pub fn host_extensions_disabled(cmdline: &str, marker: &str) -> bool {
    split_cmdline(cmdline)
        .any(|item| item.contains(EMERGENCY) || (!marker.is_empty() && item.contains(marker)))
}
