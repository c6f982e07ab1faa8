//! Semantic version ordering for asset versions.
//!
//! Accepts `MAJOR.MINOR.PATCH[-pre][+build]` as well as four-part assembly
//! style versions (`MAJOR.MINOR.PATCH.REVISION`). Build metadata is ignored.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetVersion {
    numbers: [u64; 4],
    pre: Vec<PreIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PreIdentifier {
    Numeric(u64),
    Text(String),
}

impl PartialOrd for PreIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PreIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PreIdentifier::Numeric(a), PreIdentifier::Numeric(b)) => a.cmp(b),
            (PreIdentifier::Numeric(_), PreIdentifier::Text(_)) => Ordering::Less,
            (PreIdentifier::Text(_), PreIdentifier::Numeric(_)) => Ordering::Greater,
            (PreIdentifier::Text(a), PreIdentifier::Text(b)) => {
                a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
            }
        }
    }
}

impl AssetVersion {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let without_build = input.split_once('+').map_or(input, |(v, _)| v);
        let (version_part, pre) = match without_build.split_once('-') {
            Some((v, p)) if !p.is_empty() => (v, Some(p)),
            Some(_) => return None,
            None => (without_build, None),
        };

        let parts: Vec<&str> = version_part.split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return None;
        }
        let mut numbers = [0u64; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse::<u64>().ok()?;
        }

        let pre = match pre {
            None => Vec::new(),
            Some(p) => p
                .split('.')
                .map(|id| {
                    if id.is_empty() {
                        None
                    } else if let Ok(n) = id.parse::<u64>() {
                        Some(PreIdentifier::Numeric(n))
                    } else {
                        Some(PreIdentifier::Text(id.to_string()))
                    }
                })
                .collect::<Option<Vec<_>>>()?,
        };

        Some(Self { numbers, pre })
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }
}

impl PartialOrd for AssetVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AssetVersion {
    /// Pre-release sorts below the release with the same numbers;
    /// pre-release identifiers compare pairwise, numeric below text.
    fn cmp(&self, other: &Self) -> Ordering {
        self.numbers.cmp(&other.numbers).then_with(|| {
            match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (false, true) => Ordering::Less,
                (true, false) => Ordering::Greater,
                (false, false) => self.pre.cmp(&other.pre),
            }
        })
    }
}
