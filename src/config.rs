//! Ambient configuration glue: the exports-file tokenizer, the
//! `map_static=FILE` static-id-map reader, and the optional TOML tunables
//! file (SPEC_FULL.md "Ambient stack / Configuration").
//!
//! Deliberately separate from [`crate::export::ExportDb`]: this module
//! turns text into already-typed [`ExportRecord`]/[`ExportOptions`] values
//! and feeds them to the database one call to `add_export` at a time: the
//! database itself never sees a line of exports-file syntax. Grounded in
//! the original server's `exports.c` (`getexportent`/`do_option`'s token
//! loop, `\`-continuation handling, `#`-comment stripping) and
//! `ugid_map.c`'s static-map file reader, rewritten as ordinary line-based
//! parsing instead of a hand-rolled lexer.

use std::fmt;
use std::fs;
use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::export::{ExportOptions, Pattern, UidMapMode};

/// Fatal startup-time failures: syntax errors in the exports file or a
/// static-map file, or an export root that fails canonicalization (spec
/// §9 Open Question i, resolved "reject" in SPEC_FULL.md). Never surfaced
/// on the wire — callers report these via `tracing::error!` and a non-zero
/// exit (spec §7: "User-visible behavior on catastrophic failure").
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Syntax { line: usize, message: String },
    BadRoot { path: String, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "{err}"),
            ConfigError::Syntax { line, message } => write!(f, "line {line}: {message}"),
            ConfigError::BadRoot { path, source } => write!(f, "export root {path:?} could not be resolved: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// One `<path> <client>(<opts>) ...` line, already tokenized and with its
/// continuations joined, but before client patterns are resolved into
/// [`Pattern`] buckets (that last step needs the NIS/netgroup/AF_INET
/// parsing which lives in [`parse_client`]).
struct RawLine {
    line_no: usize,
    path: String,
    clients: Vec<(String, Vec<String>)>,
}

/// Reads the exports file at `path`, joining `\`-continuations and
/// stripping `#`-comments (spec §6 "Exports file"), without yet resolving
/// client tokens.
fn tokenize(path: &Path) -> Result<Vec<RawLine>, ConfigError> {
    let text = fs::read_to_string(path)?;
    let mut joined = Vec::new();
    let mut current = String::new();
    let mut start_line = 1usize;
    let mut line_no = 0usize;

    for raw in text.lines() {
        line_no += 1;
        let line = strip_comment(raw);
        if current.is_empty() {
            start_line = line_no;
        }
        let continued = line.trim_end().ends_with('\\');
        let trimmed = line.trim_end().trim_end_matches('\\');
        current.push_str(trimmed);
        if continued {
            current.push(' ');
            continue;
        }
        if !current.trim().is_empty() {
            joined.push((start_line, std::mem::take(&mut current)));
        } else {
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        joined.push((start_line, current));
    }

    joined.into_iter().map(|(line_no, text)| parse_raw_line(line_no, &text)).collect()
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_raw_line(line_no: usize, text: &str) -> Result<RawLine, ConfigError> {
    let mut tokens = text.split_whitespace();
    let path = tokens
        .next()
        .ok_or_else(|| ConfigError::Syntax { line: line_no, message: "expected a path".into() })?
        .to_string();

    let mut clients = Vec::new();
    for token in tokens {
        let (name, opts) = match token.find('(') {
            Some(open) => {
                let close = token.rfind(')').ok_or_else(|| ConfigError::Syntax {
                    line: line_no,
                    message: format!("unterminated option list in {token:?}"),
                })?;
                (&token[..open], token[open + 1..close].split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
            }
            None => (token, Vec::new()),
        };
        clients.push((name.to_string(), opts));
    }
    Ok(RawLine { line_no, path, clients })
}

/// Resolves one exports-file client token into a [`Pattern`] (spec §6:
/// "literal name, `*.pattern`, `@netgroup`, `addr/mask`... empty means
/// anonymous").
fn parse_client(token: &str) -> Pattern {
    if token.is_empty() {
        return Pattern::Anonymous;
    }
    if let Some(group) = token.strip_prefix('@') {
        return Pattern::Netgroup(group.to_string());
    }
    if token.contains('/') {
        if let Some((addr, mask)) = parse_addr_mask(token) {
            return Pattern::AddrMask(addr, mask);
        }
    }
    if token.contains('*') || token.contains('?') {
        return Pattern::Wildcard(token.to_string());
    }
    Pattern::Literal(token.to_string())
}

fn parse_addr_mask(token: &str) -> Option<(Ipv4Addr, u32)> {
    let (addr_part, mask_part) = token.split_once('/')?;
    let addr: Ipv4Addr = addr_part.parse().ok()?;
    let mask = if let Ok(bits) = mask_part.parse::<u32>() {
        if mask_part.contains('.') {
            return None;
        }
        if bits == 0 {
            0
        } else {
            u32::MAX << (32 - bits.min(32))
        }
    } else {
        u32::from(mask_part.parse::<Ipv4Addr>().ok()?)
    };
    Some((addr, mask))
}

/// Applies one comma-separated option token to `opts` (spec §6 "Recognized
/// options" table). Unknown options are logged and ignored rather than
/// treated as fatal, matching the original's tolerance for option tokens
/// it doesn't understand (newer clients sometimes pass options an older
/// exports(5) never documented).
fn apply_option(opts: &mut ExportOptions, token: &str, line_no: usize) -> Result<(), ConfigError> {
    match token {
        "ro" => opts.read_only = true,
        "rw" => opts.read_only = false,
        "secure" => opts.secure_port = true,
        "insecure" => opts.secure_port = false,
        "root_squash" => opts.root_squash = true,
        "no_root_squash" => opts.root_squash = false,
        "all_squash" => opts.all_squash = true,
        "no_all_squash" => opts.all_squash = false,
        "link_relative" => opts.link_relative = true,
        "link_absolute" => opts.link_relative = false,
        "noaccess" => opts.no_access = true,
        "map_identity" => opts.uidmap = UidMapMode::Identity,
        "map_daemon" => opts.uidmap = UidMapMode::Daemon,
        "async" | "sync" => {}
        _ if token == "map_nis" || token.starts_with("map_nis=") => {
            opts.uidmap = UidMapMode::Nis;
            opts.nis_domain = token.strip_prefix("map_nis=").filter(|d| !d.is_empty()).map(str::to_string);
        }
        _ if token.starts_with("map_static=") => {
            opts.uidmap = UidMapMode::Static;
            let file = &token["map_static=".len()..];
            let (uid_map, gid_map) = read_static_map(Path::new(file))?;
            opts.static_uid_map = uid_map;
            opts.static_gid_map = gid_map;
        }
        _ if token.starts_with("squash_uids=") => {
            opts.squash_uids = parse_ranges(&token["squash_uids=".len()..], line_no)?;
            opts.some_squash = true;
        }
        _ if token.starts_with("squash_gids=") => {
            opts.squash_gids = parse_ranges(&token["squash_gids=".len()..], line_no)?;
            opts.some_squash = true;
        }
        _ if token.starts_with("anonuid=") => {
            opts.anon_uid = token["anonuid=".len()..]
                .parse()
                .map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad anonuid in {token:?}") })?;
        }
        _ if token.starts_with("anongid=") => {
            opts.anon_gid = token["anongid=".len()..]
                .parse()
                .map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad anongid in {token:?}") })?;
        }
        other => {
            tracing::warn!(line = line_no, option = other, "unrecognized exports(5) option, ignoring");
        }
    }
    Ok(())
}

/// Parses `squash_uids=LOW-HIGH[,LOW-HIGH...]` into inclusive ranges.
fn parse_ranges(spec: &str, line_no: usize) -> Result<Vec<(u32, u32)>, ConfigError> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .map(|range| {
            let (lo, hi) = match range.split_once('-') {
                Some((lo, hi)) => (lo, hi),
                None => (range, range),
            };
            let lo: u32 = lo.parse().map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad range {range:?}") })?;
            let hi: u32 = hi.parse().map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad range {range:?}") })?;
            Ok((lo, hi))
        })
        .collect()
}

/// One tokenized `<path> <client>(<opts>)...` line plus its resolved
/// export root, ready to feed into [`crate::export::ExportDb::add_export`].
pub struct ExportLine {
    pub root: PathBuf,
    /// `true` for the magic `=public` target (spec §6).
    pub is_public: bool,
    pub entries: Vec<(Pattern, ExportOptions)>,
}

/// Loads and fully resolves an exports file: tokenizes, canonicalizes
/// every path (Open Question i: reject on failure rather than falling back
/// to the literal path), and turns each client token into a `(Pattern,
/// ExportOptions)` pair.
///
/// Returns the resolved lines alongside the raw `(path, client-tokens)`
/// list MOUNT's `EXPORT`/`EXPORTALL` echoes back verbatim (spec §4.L /
/// `server::Server::export_list`).
pub fn load_exports(path: &Path) -> Result<(Vec<ExportLine>, Vec<(String, Vec<String>)>), ConfigError> {
    let raw_lines = tokenize(path)?;
    let mut lines = Vec::with_capacity(raw_lines.len());
    let mut export_list = Vec::with_capacity(raw_lines.len());

    for raw in raw_lines {
        let is_public = raw.path == "=public";
        let root = if is_public {
            PathBuf::from("=public")
        } else {
            fs::canonicalize(&raw.path).map_err(|source| ConfigError::BadRoot { path: raw.path.clone(), source })?
        };

        let mut entries = Vec::with_capacity(raw.clients.len());
        let mut client_names = Vec::with_capacity(raw.clients.len());
        for (name, opt_tokens) in &raw.clients {
            let mut opts = ExportOptions::default();
            for opt in opt_tokens {
                apply_option(&mut opts, opt, raw.line_no)?;
            }
            entries.push((parse_client(name), opts));
            client_names.push(name.clone());
        }
        export_list.push((raw.path.clone(), client_names));
        lines.push(ExportLine { root, is_public, entries });
    }

    Ok((lines, export_list))
}

/// Reads a `map_static=FILE` static-id-map file (spec §6 "Static-map
/// file"): `u|g LOW[-HIGH] TO` lines, blank lines and `#`-comments
/// allowed, `-` as `TO` meaning "squash this range" (handled by the caller
/// folding it into `squash_uids=`/`squash_gids=` instead, since the
/// identity map itself has no notion of squashing a range).
fn read_static_map(path: &Path) -> Result<(Vec<(u32, u32)>, Vec<(u32, u32)>), ConfigError> {
    let file = fs::File::open(path)?;
    let mut uid_map = Vec::new();
    let mut gid_map = Vec::new();

    for (idx, line) in io::BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        let line = strip_comment(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let kind = parts.next().ok_or_else(|| ConfigError::Syntax { line: line_no, message: "expected 'u' or 'g'".into() })?;
        let range = parts.next().ok_or_else(|| ConfigError::Syntax { line: line_no, message: "expected an id range".into() })?;
        let to = parts.next().ok_or_else(|| ConfigError::Syntax { line: line_no, message: "expected a target id".into() })?;

        if to == "-" {
            // Squash range: no static mapping entry, handled via squash_* options.
            continue;
        }
        let to: u32 = to.parse().map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad target id {to:?}") })?;

        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (
                lo.parse().map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad range {range:?}") })?,
                hi.parse().map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad range {range:?}") })?,
            ),
            None => {
                let v: u32 = range.parse().map_err(|_| ConfigError::Syntax { line: line_no, message: format!("bad id {range:?}") })?;
                (v, v)
            }
        };

        let target = match kind {
            "u" => &mut uid_map,
            "g" => &mut gid_map,
            other => return Err(ConfigError::Syntax { line: line_no, message: format!("expected 'u' or 'g', got {other:?}") }),
        };
        for id in lo..=hi {
            target.push((id, to + (id - lo)));
        }
    }

    Ok((uid_map, gid_map))
}

/// Cache- and timing-constant overrides read from an optional TOML file
/// (`--config FILE`, SPEC_FULL.md "Ambient stack / Configuration"). Every
/// field defaults to spec.md's fixed constant, so an absent file (or an
/// absent field within a present file) reproduces the original's hardcoded
/// behavior exactly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Overrides [`crate::cache::FH_LIMIT`].
    pub fh_limit: usize,
    /// Fraction (0.0-1.0) of the process's fd soft limit to allow the
    /// descriptor cache to use; overrides the ~75% spec default.
    pub fd_limit_fraction: f64,
    /// Overrides [`crate::cache::DISCARD_INTERVAL`], in seconds.
    pub discard_interval_secs: u64,
    /// Overrides [`crate::cache::CLOSE_INTERVAL`], in seconds.
    pub close_interval_secs: u64,
    /// Overrides [`crate::export::MAX_CACHED_ANONYMOUS`].
    pub max_cached_anonymous: usize,
    /// Overrides the identity-map dynamic-lookup expiry (spec §4.H:
    /// "store with expiry `now + 300s`"), in seconds.
    pub idmap_expiry_secs: u64,
    /// Overrides the identity-sibling failure quarantine (spec §7: "marks
    /// the client address unavailable for 15 minutes"), in seconds.
    pub sibling_quarantine_secs: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            fh_limit: crate::cache::FH_LIMIT,
            fd_limit_fraction: 0.75,
            discard_interval_secs: crate::cache::DISCARD_INTERVAL.as_secs(),
            close_interval_secs: crate::cache::CLOSE_INTERVAL.as_secs(),
            max_cached_anonymous: crate::export::MAX_CACHED_ANONYMOUS,
            idmap_expiry_secs: 300,
            sibling_quarantine_secs: 15 * 60,
        }
    }
}

impl Tunables {
    pub fn discard_interval(&self) -> Duration {
        Duration::from_secs(self.discard_interval_secs)
    }

    pub fn close_interval(&self) -> Duration {
        Duration::from_secs(self.close_interval_secs)
    }

    /// Loads tunables from `path`, or the hardcoded defaults when `path`
    /// is `None` (no TOML file configured is the common case, per spec.md
    /// §6's CLI surface, which has no flag requiring one).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            None => Ok(Tunables::default()),
            Some(path) => {
                let text = fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|err| ConfigError::Syntax { line: 0, message: err.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn strips_comments_and_joins_continuations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f, "{} host1(rw) \\", dir.path().display()).unwrap();
        writeln!(f, "    host2(ro)").unwrap();
        drop(f);

        let raw = tokenize(&path).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].clients.len(), 2);
        assert_eq!(raw[0].clients[0].0, "host1");
        assert_eq!(raw[0].clients[0].1, vec!["rw".to_string()]);
    }

    #[test]
    fn parse_client_recognizes_every_bucket() {
        assert!(matches!(parse_client(""), Pattern::Anonymous));
        assert!(matches!(parse_client("@group"), Pattern::Netgroup(g) if g == "group"));
        assert!(matches!(parse_client("*.corp"), Pattern::Wildcard(_)));
        assert!(matches!(parse_client("10.0.0.0/24"), Pattern::AddrMask(_, _)));
        assert!(matches!(parse_client("host1.lab.corp"), Pattern::Literal(_)));
    }

    #[test]
    fn addr_mask_accepts_both_cidr_bits_and_dotted_mask() {
        let (a1, m1) = parse_addr_mask("10.0.0.0/24").unwrap();
        assert_eq!(a1, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(m1, 0xFFFF_FF00);

        let (a2, m2) = parse_addr_mask("10.0.0.0/255.255.255.0").unwrap();
        assert_eq!(a2, a1);
        assert_eq!(m2, m1);
    }

    #[test]
    fn apply_option_round_trips_ro_rw() {
        let mut opts = ExportOptions::default();
        apply_option(&mut opts, "ro", 1).unwrap();
        assert!(opts.read_only);
        apply_option(&mut opts, "rw", 1).unwrap();
        assert!(!opts.read_only);
    }

    #[test]
    fn squash_uids_range_is_parsed_inclusive() {
        let mut opts = ExportOptions::default();
        apply_option(&mut opts, "squash_uids=100-102,500", 1).unwrap();
        assert_eq!(opts.squash_uids, vec![(100, 102), (500, 500)]);
        assert!(opts.some_squash);
    }

    #[test]
    fn static_map_file_expands_ranges_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.map");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "u 1000-1002 2000").unwrap();
        writeln!(f, "g 500 600").unwrap();
        writeln!(f, "u 9000 -").unwrap();
        drop(f);

        let (uid_map, gid_map) = read_static_map(&path).unwrap();
        assert_eq!(uid_map, vec![(1000, 2000), (1001, 2001), (1002, 2002)]);
        assert_eq!(gid_map, vec![(500, 600)]);
    }

    #[test]
    fn load_exports_rejects_nonexistent_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports");
        fs::write(&path, format!("{}/does-not-exist host1(rw)\n", dir.path().display())).unwrap();
        let err = load_exports(&path).unwrap_err();
        assert!(matches!(err, ConfigError::BadRoot { .. }));
    }

    #[test]
    fn load_exports_accepts_public_target_without_canonicalizing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports");
        fs::write(&path, "=public host1(rw)\n").unwrap();
        let (lines, _) = load_exports(&path).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].is_public);
    }

    #[test]
    fn tunables_default_matches_spec_constants() {
        let t = Tunables::default();
        assert_eq!(t.fh_limit, crate::cache::FH_LIMIT);
        assert_eq!(t.discard_interval(), crate::cache::DISCARD_INTERVAL);
    }
}
