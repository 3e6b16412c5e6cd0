//! Hierarchy string grammar.
//!
//! ```text
//! hierarchy := level (',' level)*
//! level     := def ('+' def)*
//! def       := (name | '[' ranges ']') [':' N | ':max' N] ['*']
//! ranges    := range (';' range)*
//! range     := rank ['-' rank]
//! ```
//!
//! `numa,socket` builds two named levels. `[0-3]+[4-7]` builds one level of
//! two explicit rank groups. `socket:2` splits each socket group in two,
//! `node:max4` caps groups at four ranks. In a level with several defs,
//! `*` marks the def every rank not claimed by the others follows.

use std::ops::RangeInclusive;

use crate::error::{Result, ShmCommError};
use crate::topology::Locality;
use crate::types::Rank;

/// What a def groups ranks by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalitySource {
    /// A hardware scope reported by the locality query.
    Named(Locality),
    /// An explicit list of rank ranges.
    Ranks(Vec<RangeInclusive<Rank>>),
}

/// One grouping rule within a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityDef {
    pub source: LocalitySource,
    /// Split the resulting group into this many near-equal pieces (0/1 = off).
    pub split: u32,
    /// Cap the resulting pieces at this many ranks (0 = off).
    pub max_ranks: u32,
    pub repeat: bool,
}

impl LocalityDef {
    pub fn named(loc: Locality) -> Self {
        Self {
            source: LocalitySource::Named(loc),
            split: 0,
            max_ranks: 0,
            repeat: false,
        }
    }

    /// Named scope this def follows; [`Locality::NONE`] for rank lists.
    pub fn named_locality(&self) -> Locality {
        match self.source {
            LocalitySource::Named(loc) => loc,
            LocalitySource::Ranks(_) => Locality::NONE,
        }
    }

    pub fn rank_list(&self) -> Option<&[RangeInclusive<Rank>]> {
        match &self.source {
            LocalitySource::Ranks(ranges) => Some(ranges),
            LocalitySource::Named(_) => None,
        }
    }

    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.rank_list()
            .is_some_and(|ranges| ranges.iter().any(|r| r.contains(&rank)))
    }
}

/// All defs that make up one hierarchy level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelDef {
    pub defs: Vec<LocalityDef>,
}

impl LevelDef {
    /// A level needs a synthesized locality bit unless it is a single,
    /// unmodified named scope.
    pub fn is_virtual(&self) -> bool {
        match self.defs.as_slice() {
            [def] => def.rank_list().is_some() || def.split > 1 || def.max_ranks > 0,
            _ => true,
        }
    }
}

/// Parse a hierarchy string into level definitions.
pub fn parse_hierarchy(s: &str) -> Result<Vec<LevelDef>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(s, ',')
        .into_iter()
        .map(|level| parse_level(level, s))
        .collect()
}

fn parse_level(level: &str, whole: &str) -> Result<LevelDef> {
    let defs = split_top_level(level, '+')
        .into_iter()
        .map(|def| parse_def(def.trim(), whole))
        .collect::<Result<Vec<_>>>()?;
    if defs.iter().filter(|d| d.repeat).count() > 1 {
        return Err(bad(whole, "more than one '*' def in a level"));
    }
    Ok(LevelDef { defs })
}

fn parse_def(def: &str, whole: &str) -> Result<LocalityDef> {
    if def.is_empty() {
        return Err(bad(whole, "empty locality"));
    }

    let (def, repeat) = match def.strip_suffix('*') {
        Some(rest) => (rest.trim_end(), true),
        None => (def, false),
    };

    let (body, modifier) = if let Some(rest) = def.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| bad(whole, "unterminated rank list"))?;
        let ranges = parse_ranges(&rest[..close], whole)?;
        let tail = rest[close + 1..].trim();
        (LocalitySource::Ranks(ranges), tail)
    } else {
        let (name, tail) = match def.find(':') {
            Some(i) => (&def[..i], &def[i..]),
            None => (def, ""),
        };
        let loc = Locality::from_name(name.trim())
            .ok_or_else(|| bad(whole, &format!("unknown locality '{}'", name.trim())))?;
        (LocalitySource::Named(loc), tail)
    };

    let mut out = LocalityDef {
        source: body,
        split: 0,
        max_ranks: 0,
        repeat,
    };

    if !modifier.is_empty() {
        let m = modifier
            .strip_prefix(':')
            .ok_or_else(|| bad(whole, &format!("unexpected '{modifier}'")))?
            .trim();
        if let Some(n) = m.strip_prefix("max") {
            out.max_ranks = parse_count(n, whole)?;
        } else {
            out.split = parse_count(m, whole)?;
        }
    }
    Ok(out)
}

fn parse_ranges(list: &str, whole: &str) -> Result<Vec<RangeInclusive<Rank>>> {
    let mut ranges = Vec::new();
    for item in list.split(';').map(str::trim) {
        let (lo, hi) = match item.split_once('-') {
            Some((a, b)) => (parse_rank(a, whole)?, parse_rank(b, whole)?),
            None => {
                let r = parse_rank(item, whole)?;
                (r, r)
            }
        };
        if lo > hi {
            return Err(bad(whole, &format!("descending rank range '{item}'")));
        }
        ranges.push(lo..=hi);
    }
    Ok(ranges)
}

fn parse_rank(s: &str, whole: &str) -> Result<Rank> {
    s.trim()
        .parse::<Rank>()
        .map_err(|_| bad(whole, &format!("bad rank '{}'", s.trim())))
}

fn parse_count(s: &str, whole: &str) -> Result<u32> {
    match s.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(bad(whole, &format!("bad modifier count '{}'", s.trim()))),
    }
}

/// Split on `sep` outside of `[...]`.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn bad(whole: &str, what: &str) -> ShmCommError {
    ShmCommError::config(format!("hierarchy '{whole}': {what}"))
}
