//! The quirks database: glob/HWID-matched per-device overrides.
//!
//! A rule matches either an HWID pattern (`VVVV:DDDD` or `VVVV:*`) or a
//! glob against the device's make-and-model string, and picks the most
//! specific match the way a firewall or ACL rule set would; the *value*
//! for each named setting is independently the highest-weight match
//! across every loaded file.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ini_ext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMethod {
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuggyIppResponses {
    Allow,
    Reject,
    Sanitize,
}

#[derive(Debug, Clone, PartialEq)]
enum QuirkValue {
    Bool(bool),
    Unsigned(u64),
    Duration(Duration),
    ResetMethod(ResetMethod),
    BuggyIppRsp(BuggyIppResponses),
    Raw(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwId {
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    HwidExact(u16, u16),
    HwidVidOnly(u16),
    Glob(String),
}

impl Pattern {
    fn parse(header: &str) -> Self {
        if let Some((vid, pid)) = header.split_once(':') {
            if let Ok(vid) = u16::from_str_radix(vid.trim(), 16) {
                let pid = pid.trim();
                if pid == "*" {
                    return Pattern::HwidVidOnly(vid);
                }
                if let Ok(pid) = u16::from_str_radix(pid, 16) {
                    return Pattern::HwidExact(vid, pid);
                }
            }
        }
        Pattern::Glob(header.to_string())
    }

    /// Returns the match weight if `self` matches this device, else `None`.
    fn weight(&self, hwid: HwId, make_and_model: &str) -> Option<u32> {
        match self {
            Pattern::HwidExact(vid, pid) if *vid == hwid.vendor_id && *pid == hwid.product_id => {
                Some(1000)
            }
            Pattern::HwidExact(..) => None,
            Pattern::HwidVidOnly(vid) if *vid == hwid.vendor_id => Some(1),
            Pattern::HwidVidOnly(_) => None,
            Pattern::Glob(pattern) => glob_match(make_and_model, pattern),
        }
    }
}

/// Match a glob pattern (`*` only) against `s`, returning the count of
/// non-wildcard characters consumed on success.
pub fn glob_match(s: &str, pattern: &str) -> Option<u32> {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let weight = p.iter().filter(|&&c| c != '*').count() as u32;

    // Standard two-pointer wildcard matcher with backtracking on the last `*`.
    let (mut si, mut pi) = (0usize, 0usize);
    let (mut star_pi, mut star_si): (Option<usize>, usize) = (None, 0);

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_pi = Some(pi);
            star_si = si;
            pi += 1;
        } else if let Some(last_star) = star_pi {
            pi = last_star + 1;
            star_si += 1;
            si = star_si;
        } else {
            return None;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }

    if pi == p.len() { Some(weight) } else { None }
}

#[derive(Debug, Clone)]
struct QuirkRule {
    origin: String,
    pattern: Pattern,
    name: String,
    value: QuirkValue,
    load_order: u64,
}

/// All quirk rules loaded from disk, not yet resolved against a device.
#[derive(Debug, Default, Clone)]
pub struct QuirksDb {
    rules: Vec<QuirkRule>,
}

/// The merged, per-device set of effective settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Quirks {
    pub blacklist: bool,
    pub buggy_ipp_responses: BuggyIppResponses,
    pub disable_fax: bool,
    pub ignore_ipp_status: bool,
    pub init_delay: Duration,
    pub init_reset: ResetMethod,
    pub init_retry_partial: bool,
    pub init_timeout: Duration,
    pub request_delay: Duration,
    pub usb_max_interfaces: u32,
    pub usb_send_delay_threshold: u64,
    pub usb_send_delay: Duration,
    pub zlp_recv_hack: bool,
    pub zlp_send: bool,
    pub http_headers: BTreeMap<String, String>,
}

impl Default for Quirks {
    fn default() -> Self {
        Self {
            blacklist: false,
            buggy_ipp_responses: BuggyIppResponses::Allow,
            disable_fax: false,
            ignore_ipp_status: false,
            init_delay: Duration::ZERO,
            init_reset: ResetMethod::None,
            init_retry_partial: false,
            init_timeout: Duration::from_secs(20),
            request_delay: Duration::ZERO,
            usb_max_interfaces: 0,
            usb_send_delay_threshold: 0,
            usb_send_delay: Duration::ZERO,
            zlp_recv_hack: false,
            zlp_send: false,
            http_headers: BTreeMap::new(),
        }
    }
}

const KNOWN_NAMES: &[&str] = &[
    "blacklist",
    "buggy-ipp-responses",
    "disable-fax",
    "ignore-ipp-status",
    "init-delay",
    "init-reset",
    "init-retry-partial",
    "init-timeout",
    "request-delay",
    "usb-max-interfaces",
    "usb-send-delay-threshold",
    "usb-send-delay",
    "zlp-recv-hack",
    "zlp-send",
];

impl QuirksDb {
    /// Load quirks files from `/usr/share/ipp-usb/quirks`, then
    /// `/etc/ipp-usb/quirks` so the latter's rules get lower (earlier)
    /// load-order numbers and therefore win weight ties, matching the
    /// documented "latter takes precedence".
    pub fn load_default_dirs() -> Result<Self> {
        Self::load_dirs(&[
            PathBuf::from("/etc/ipp-usb/quirks"),
            PathBuf::from("/usr/share/ipp-usb/quirks"),
        ])
    }

    pub fn load_dirs(dirs: &[PathBuf]) -> Result<Self> {
        let mut db = QuirksDb::default();
        let mut load_order = 0u64;

        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
                .collect();
            files.sort();

            for file in files {
                db.load_file(&file, &mut load_order)?;
            }
        }
        Ok(db)
    }

    fn load_file(&mut self, path: &Path, load_order: &mut u64) -> Result<()> {
        let ini = ini_ext::load(path)?;
        for (section, properties) in ini.iter() {
            let Some(header) = section else { continue };
            let pattern = Pattern::parse(header);
            for (key, value) in properties.iter() {
                let parsed = parse_value(key, value)?;
                self.rules.push(QuirkRule {
                    origin: format!("{}:{header}", path.display()),
                    pattern: pattern.clone(),
                    name: key.to_string(),
                    value: parsed,
                    load_order: *load_order,
                });
                *load_order += 1;
            }
        }
        Ok(())
    }

    /// Resolve the effective `Quirks` for a device, matching by HWID alone,
    /// for use before the model string is known.
    pub fn resolve_by_hwid(&self, hwid: HwId) -> Quirks {
        self.resolve(hwid, "")
    }

    /// Resolve the effective `Quirks`, matching by both HWID and the
    /// resolved make-and-model string; reloading by model name this way
    /// merges the model-specific rules over the HWID-only set.
    pub fn resolve(&self, hwid: HwId, make_and_model: &str) -> Quirks {
        let matches: Vec<(u32, &QuirkRule)> = self
            .rules
            .iter()
            .filter_map(|r| r.pattern.weight(hwid, make_and_model).map(|w| (w, r)))
            .collect();

        let mut quirks = Quirks::default();

        if matches
            .iter()
            .any(|(_, r)| r.name == "blacklist" && r.value == QuirkValue::Bool(true))
        {
            quirks.blacklist = true;
        }

        for name in KNOWN_NAMES {
            if let Some(value) = best_match(&matches, name) {
                apply(&mut quirks, name, value);
            }
        }

        // http-<header> overrides: every matching rule contributes, later
        // winners (by weight, then load order) overwrite earlier ones per header.
        let mut header_candidates: BTreeMap<&str, Vec<(u32, u64, &str)>> = BTreeMap::new();
        for (weight, rule) in &matches {
            if let Some(header) = rule.name.strip_prefix("http-") {
                if let QuirkValue::Raw(v) = &rule.value {
                    header_candidates
                        .entry(header)
                        .or_default()
                        .push((*weight, rule.load_order, v.as_str()));
                }
            }
        }
        for (header, mut candidates) in header_candidates {
            candidates.sort_by_key(|(w, lo, _)| (Reverse(*w), *lo));
            if let Some((_, _, value)) = candidates.first() {
                quirks.http_headers.insert(header.to_string(), value.to_string());
            }
        }

        quirks
    }

    /// Number of individual key/value rules loaded, reported by `ipp-usb check`.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    #[cfg(test)]
    fn origins(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.origin.as_str()).collect()
    }
}

fn best_match<'a>(matches: &'a [(u32, &'a QuirkRule)], name: &str) -> Option<&'a QuirkValue> {
    matches
        .iter()
        .filter(|(_, r)| r.name == name)
        .min_by_key(|(weight, r)| (Reverse(*weight), r.load_order))
        .map(|(_, r)| &r.value)
}

fn apply(quirks: &mut Quirks, name: &str, value: &QuirkValue) {
    match (name, value) {
        ("buggy-ipp-responses", QuirkValue::Raw(v)) => {
            quirks.buggy_ipp_responses = match v.as_str() {
                "reject" => BuggyIppResponses::Reject,
                "sanitize" => BuggyIppResponses::Sanitize,
                _ => BuggyIppResponses::Allow,
            };
        }
        ("disable-fax", QuirkValue::Bool(b)) => quirks.disable_fax = *b,
        ("ignore-ipp-status", QuirkValue::Bool(b)) => quirks.ignore_ipp_status = *b,
        ("init-delay", QuirkValue::Duration(d)) => quirks.init_delay = *d,
        ("init-reset", QuirkValue::ResetMethod(m)) => quirks.init_reset = *m,
        ("init-retry-partial", QuirkValue::Bool(b)) => quirks.init_retry_partial = *b,
        ("init-timeout", QuirkValue::Duration(d)) => quirks.init_timeout = *d,
        ("request-delay", QuirkValue::Duration(d)) => quirks.request_delay = *d,
        ("usb-max-interfaces", QuirkValue::Unsigned(n)) => quirks.usb_max_interfaces = *n as u32,
        ("usb-send-delay-threshold", QuirkValue::Unsigned(n)) => {
            quirks.usb_send_delay_threshold = *n;
        }
        ("usb-send-delay", QuirkValue::Duration(d)) => quirks.usb_send_delay = *d,
        ("zlp-recv-hack", QuirkValue::Bool(b)) => quirks.zlp_recv_hack = *b,
        ("zlp-send", QuirkValue::Bool(b)) => quirks.zlp_send = *b,
        _ => {}
    }
}

fn parse_value(name: &str, raw: &str) -> Result<QuirkValue> {
    if name.starts_with("http-") {
        return Ok(QuirkValue::Raw(raw.to_string()));
    }

    Ok(match name {
        "blacklist" | "disable-fax" | "ignore-ipp-status" | "init-retry-partial"
        | "zlp-recv-hack" | "zlp-send" => QuirkValue::Bool(ini_ext::parse_bool(raw)?),
        "buggy-ipp-responses" => match raw.trim() {
            "allow" | "reject" | "sanitize" => QuirkValue::Raw(raw.trim().to_string()),
            other => {
                return Err(Error::Configuration(format!(
                    "invalid buggy-ipp-responses value {other:?}"
                )));
            }
        },
        "init-delay" | "init-timeout" | "request-delay" | "usb-send-delay" => {
            QuirkValue::Duration(ini_ext::parse_duration(raw)?)
        }
        "init-reset" => QuirkValue::ResetMethod(match raw.trim() {
            "none" => ResetMethod::None,
            "soft" => ResetMethod::Soft,
            "hard" => ResetMethod::Hard,
            other => {
                return Err(Error::Configuration(format!(
                    "invalid init-reset value {other:?}"
                )));
            }
        }),
        "usb-max-interfaces" | "usb-send-delay-threshold" => QuirkValue::Unsigned(
            raw.trim()
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid integer {raw:?}")))?,
        ),
        // Unknown keys are ignored for forward-compat; keep the raw value
        // around in case a future release recognizes it.
        _ => QuirkValue::Raw(raw.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_quirks(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn glob_weight_is_literal_char_count() {
        assert_eq!(glob_match("Pantum P2502W", "Pantum*"), Some(6));
        assert_eq!(glob_match("Epson ET-2750", "Pantum*"), None);
        assert_eq!(glob_match("anything", "*"), Some(0));
    }

    #[test]
    fn hwid_exact_beats_vid_only_beats_glob() {
        let dir = tempfile::tempdir().unwrap();
        write_quirks(
            dir.path(),
            "10-rules.conf",
            "[0x03f0:*]\ninit-delay = 10\n\n[0x03f0:1234]\ninit-delay = 20\n\n[HP*]\ninit-delay = 30\n",
        );
        let db = QuirksDb::load_dirs(&[dir.path().to_path_buf()]).unwrap();

        let q = db.resolve(
            HwId {
                vendor_id: 0x03f0,
                product_id: 0x1234,
            },
            "HP LaserJet",
        );
        assert_eq!(q.init_delay, Duration::from_millis(20));
    }

    #[test]
    fn blacklist_rejects_regardless_of_weight() {
        let dir = tempfile::tempdir().unwrap();
        write_quirks(dir.path(), "10-rules.conf", "[Pantum*]\nblacklist = true\n");
        let db = QuirksDb::load_dirs(&[dir.path().to_path_buf()]).unwrap();

        let q = db.resolve(
            HwId {
                vendor_id: 0x04b8,
                product_id: 0x0001,
            },
            "Pantum P2502W",
        );
        assert!(q.blacklist);
    }

    #[test]
    fn http_header_override() {
        let dir = tempfile::tempdir().unwrap();
        write_quirks(
            dir.path(),
            "10-rules.conf",
            "[HP LaserJet MFP M28-M31]\nhttp-connection = keep-alive\n",
        );
        let db = QuirksDb::load_dirs(&[dir.path().to_path_buf()]).unwrap();

        let q = db.resolve(
            HwId {
                vendor_id: 0x03f0,
                product_id: 0x1234,
            },
            "HP LaserJet MFP M28-M31",
        );
        assert_eq!(
            q.http_headers.get("connection").map(String::as_str),
            Some("keep-alive")
        );

        let other = db.resolve(
            HwId {
                vendor_id: 0x04b8,
                product_id: 0x0001,
            },
            "Canon Pixma",
        );
        assert!(other.http_headers.is_empty());
    }

    /// spec.md §8: "For all glob patterns P and strings S, `GlobMatch(S, P)
    /// ≥ 0` iff S matches P; the returned weight equals the count of
    /// non-wildcard characters consumed." Exercised here against randomly
    /// generated strings built *from* a randomly starred pattern, so most
    /// draws are genuine matches rather than only the (easy) negative case.
    #[test]
    fn glob_weight_matches_literal_count_on_random_patterns() {
        use rand::Rng;
        use rand::seq::SliceRandom;

        let alphabet: Vec<char> = "ABCabc012-_".chars().collect();
        let mut rng = rand::rng();

        for _ in 0..200 {
            let literal_len = rng.gen_range(0..6);
            let literal: String = (0..literal_len)
                .map(|_| *alphabet.choose(&mut rng).unwrap())
                .collect();

            let star_prefix = rng.gen_bool(0.5);
            let star_suffix = rng.gen_bool(0.5);
            let mut pattern = String::new();
            if star_prefix {
                pattern.push('*');
            }
            pattern.push_str(&literal);
            if star_suffix {
                pattern.push('*');
            }

            let prefix_junk: String = (0..rng.gen_range(0..4))
                .map(|_| *alphabet.choose(&mut rng).unwrap())
                .collect();
            let suffix_junk: String = (0..rng.gen_range(0..4))
                .map(|_| *alphabet.choose(&mut rng).unwrap())
                .collect();
            let candidate = format!(
                "{}{}{}",
                if star_prefix { &prefix_junk } else { "" },
                literal,
                if star_suffix { &suffix_junk } else { "" },
            );

            match glob_match(&candidate, &pattern) {
                Some(weight) => assert_eq!(
                    weight, literal_len as u32,
                    "pattern {pattern:?} against {candidate:?}"
                ),
                None => {
                    // Only acceptable when the pattern genuinely can't match,
                    // e.g. a non-starred pattern against a candidate we
                    // padded with junk on a side with no wildcard.
                    assert!(
                        (!star_prefix && !prefix_junk.is_empty())
                            || (!star_suffix && !suffix_junk.is_empty()),
                        "pattern {pattern:?} should have matched {candidate:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn load_order_is_deterministic_regardless_of_file_read_order() {
        let dir = tempfile::tempdir().unwrap();
        write_quirks(dir.path(), "10-a.conf", "[Pantum*]\ninit-delay = 10\n");
        write_quirks(dir.path(), "20-b.conf", "[Pantum*]\ninit-delay = 20\n");
        let db = QuirksDb::load_dirs(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(db.origins().len(), 2);

        let q = db.resolve(
            HwId {
                vendor_id: 1,
                product_id: 1,
            },
            "Pantum P2502W",
        );
        // Equal weight, first-loaded (10-a.conf, lower load_order) wins.
        assert_eq!(q.init_delay, Duration::from_millis(10));
    }
}
