//! Platform-aware configuration scrubbing.
//!
//! `scrub(raw, platform)` strips dynamic fields from a device configuration
//! before it is committed, so counters, timestamps, certificates, and
//! ephemeral identifiers never show up as diffs. Every removed value is
//! replaced by a fixed sentinel, preserving the surrounding structure, and
//! the result is hashed so unchanged devices hash identically across runs.
//!
//! Stripped per platform:
//! - ios:       uptime, last-config-change, ntp clock-period, board serial,
//!              crypto PKI certificate blocks
//! - nxos:      uptime, last-config-change, serial/module numbers, ntp, PKI
//! - eos:       uptime, last-config-change, ntp, PKI
//! - dellos10:  date/time, uptime, last-config-change, ntp, PKI
//! - panos:     serial, uptime, time, app/threat/antivirus/wildfire versions
//! - fortios:   uuid, timestamp, lastupdate, build
//! - common:    IPv4 literals, ISO-8601 timestamps (all platforms, last)

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::platform::Platform;

/// Normalized text plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubOutcome {
    /// Normalized configuration text.
    pub text: String,
    /// Lowercase hex SHA-256 of the normalized UTF-8 bytes.
    pub hash: String,
}

struct Rule {
    re: Regex,
    replacement: &'static str,
}

impl Rule {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        // Patterns are compile-time constants; a malformed one is a
        // programmer error, not a runtime condition.
        let re = Regex::new(pattern).expect("scrub pattern must compile");
        Self { re, replacement }
    }

    fn apply(&self, text: &str) -> String {
        self.re.replace_all(text, self.replacement).into_owned()
    }
}

/// Multi-line PKI certificate block: the opener line plus every following
/// indented line. Stops at the first non-indented line, never past the
/// block terminator.
const PKI_BLOCK: (&str, &str) = (
    r"(?m)^crypto pki certificate [^\n]*(?:\n[ \t][^\n]*)*",
    "<certificate>",
);

const NTP_CLOCK_PERIOD: (&str, &str) = (r"ntp clock-period \d+", "ntp clock-period <uptime>");

fn rules(pairs: &[(&str, &'static str)]) -> Vec<Rule> {
    pairs.iter().map(|(p, r)| Rule::new(p, r)).collect()
}

static IOS_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r"uptime is [^\n]+", "uptime is <uptime>"),
        (
            r"Last configuration change at [^\n]+",
            "Last configuration change at <timestamp>",
        ),
        NTP_CLOCK_PERIOD,
        (r"Processor board ID \S+", "Processor board ID <serial>"),
        PKI_BLOCK,
    ])
});

static NXOS_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r"System uptime:[^\n]+", "System uptime: <uptime>"),
        (
            r"Last configuration change at [^\n]+",
            "Last configuration change at <timestamp>",
        ),
        (r"serial-number: \S+", "serial-number: <serial>"),
        (r"module-number: \d+", "module-number: <serial>"),
        NTP_CLOCK_PERIOD,
        PKI_BLOCK,
    ])
});

static EOS_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r"System uptime:[^\n]+", "System uptime: <uptime>"),
        (
            r"Last configuration change at [^\n]+",
            "Last configuration change at <timestamp>",
        ),
        NTP_CLOCK_PERIOD,
        PKI_BLOCK,
    ])
});

static DELLOS10_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r"Current date/time is[^\n]+", "Current date/time is <timestamp>"),
        (r"System uptime is [^\n]+", "System uptime is <uptime>"),
        (
            r"Last configuration change on [^\n]+",
            "Last configuration change on <timestamp>",
        ),
        NTP_CLOCK_PERIOD,
        PKI_BLOCK,
    ])
});

static PANOS_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r"(?s)<serial>.*?</serial>", "<serial><serial></serial>"),
        (r"(?s)<uptime>.*?</uptime>", "<uptime><uptime></uptime>"),
        (r"(?s)<time>.*?</time>", "<time><timestamp></time>"),
        (
            r"(?s)<app-version>.*?</app-version>",
            "<app-version><version></app-version>",
        ),
        (
            r"(?s)<threat-version>.*?</threat-version>",
            "<threat-version><version></threat-version>",
        ),
        (
            r"(?s)<antivirus-version>.*?</antivirus-version>",
            "<antivirus-version><version></antivirus-version>",
        ),
        (
            r"(?s)<wildfire-version>.*?</wildfire-version>",
            "<wildfire-version><version></wildfire-version>",
        ),
    ])
});

static FORTIOS_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r#"uuid\s*=\s*"[^"]*""#, r#"uuid = "<uuid>""#),
        (r"set uuid \S+", "set uuid <uuid>"),
        (r"timestamp\s*=\s*\d+", "timestamp = <timestamp>"),
        (r"lastupdate\s*=\s*\d+", "lastupdate = <timestamp>"),
        (r"build\s*=\s*\d+", "build = <build>"),
    ])
});

static COMMON_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "<ip-address>"),
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?",
            "<timestamp>",
        ),
    ])
});

fn platform_rules(platform: Platform) -> &'static [Rule] {
    match platform {
        Platform::Ios => &IOS_RULES,
        Platform::Nxos => &NXOS_RULES,
        Platform::Eos => &EOS_RULES,
        Platform::DellOs10 => &DELLOS10_RULES,
        Platform::Panos => &PANOS_RULES,
        Platform::Fortios => &FORTIOS_RULES,
    }
}

/// Normalize `raw` for `platform` and hash the result.
///
/// Pure and deterministic: no I/O, and an input with nothing to scrub comes
/// back byte-identical. Re-scrubbing scrubbed output is a fixed point, so
/// two runs against an unchanged device always hash equal.
pub fn scrub(raw: &str, platform: Platform) -> ScrubOutcome {
    let mut text = raw.to_string();
    for rule in platform_rules(platform) {
        text = rule.apply(&text);
    }
    for rule in COMMON_RULES.iter() {
        text = rule.apply(&text);
    }
    let hash = hex::encode(Sha256::digest(text.as_bytes()));
    ScrubOutcome { text, hash }
}
