/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

/// One file of the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// base name within the directory.
    pub filename: String,
    /// filesystem modification time.
    pub modification_time: time::OffsetDateTime,
}

/// The log families to follow, in a stable order.
#[derive(Debug, Clone)]
pub struct LogPatterns {
    patterns: Vec<String>,
    indexes: std::collections::HashMap<String, usize>,
}

impl LogPatterns {
    /// Build from base names such as `mail.log`.
    #[must_use]
    pub fn new(patterns: Vec<String>) -> Self {
        let indexes = patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();

        Self { patterns, indexes }
    }

    /// The families followed when nothing is configured.
    #[must_use]
    pub fn default_patterns() -> Self {
        Self::new(
            ["mail.log", "mail.err", "mail.warn", "zimbra.log", "maillog"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        )
    }

    /// The configured base names, in order.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Stable index of one family; used as an ordering tie-breaker.
    ///
    /// # Panics
    ///
    /// An unknown pattern is a programmer error: queues are always built
    /// from this very set.
    #[must_use]
    pub fn index_of(&self, pattern: &str) -> usize {
        *self
            .indexes
            .get(pattern)
            .unwrap_or_else(|| panic!("pattern '{pattern}' is not part of this set"))
    }
}

/// Replay plans per family: oldest first, current base file last.
pub type FileQueues = std::collections::HashMap<String, Vec<FileEntry>>;

#[derive(Clone, Copy)]
enum SuffixOrder {
    /// lexicographic date suffixes: greater means more recent.
    Normal = 1,
    /// numeric rotation suffixes: greater means older.
    Reverse = -1,
}

struct Recognizer {
    regex: regex::Regex,
    pattern: String,
    order: SuffixOrder,
}

// logrotate's two filename conventions; see logrotate.conf(5)
fn build_recognizer(kind: usize, pattern: &str) -> Recognizer {
    let escaped = regex::escape(pattern);

    let (expression, order) = match kind {
        // format mail.log-20201008.(gz|bz2): the suffix is a date,
        // lexicographically sortable
        0 => (
            format!("^({escaped})(-(\\d{{8}})(\\.(gz|bz2))?)?$"),
            SuffixOrder::Normal,
        ),
        // format mail.log.3.(gz|bz2): the higher the suffix, the older
        // the file
        1 => (
            format!("^({escaped})(\\.(\\d+)(\\.(gz|bz2))?)?$"),
            SuffixOrder::Reverse,
        ),
        _ => unreachable!("only two filename conventions exist"),
    };

    Recognizer {
        regex: regex::Regex::new(&expression).expect("recognizer expressions are well-formed"),
        pattern: pattern.to_string(),
        order,
    }
}

fn sorted_entries_for_recognizer(
    list: &[FileEntry],
    recognizer: &Recognizer,
    initial_time: Option<time::OffsetDateTime>,
) -> Vec<FileEntry> {
    struct Rec {
        entry: FileEntry,
        index: i64,
        compressed: bool,
    }

    let mut recs = Vec::new();

    for entry in list {
        let Some(captures) = recognizer.regex.captures(&entry.filename) else {
            continue;
        };

        // always include the current log file even when it is older than
        // the initial time: future writes to it belong to the live window
        if entry.filename != recognizer.pattern {
            if let Some(initial_time) = initial_time {
                if entry.modification_time < initial_time {
                    continue;
                }
            }
        }

        let index = captures
            .get(3)
            .map_or(0, |m| m.as_str().parse().expect("\\d{1,8} fits an i64"));

        recs.push(Rec {
            entry: entry.clone(),
            index,
            compressed: captures.get(5).is_some(),
        });
    }

    if recs.len() <= 1 {
        return recs.into_iter().map(|r| r.entry).collect();
    }

    let order = recognizer.order as i64;

    recs.sort_by(|a, b| {
        let a_is_base = a.entry.filename == recognizer.pattern;
        let b_is_base = b.entry.filename == recognizer.pattern;

        // the base file is always the last element
        match (a_is_base, b_is_base) {
            (false, true) => return std::cmp::Ordering::Less,
            (true, false) => return std::cmp::Ordering::Greater,
            (true, true) => return std::cmp::Ordering::Equal,
            (false, false) => {}
        }

        if a.index == b.index {
            // same rotation in both plain and compressed form: the
            // compressed one goes first and wins the dedup below
            return (!a.compressed).cmp(&!b.compressed);
        }

        (a.index * order).cmp(&(b.index * order))
    });

    let mut entries = Vec::with_capacity(recs.len());
    let mut last_index: Option<i64> = None;

    for rec in recs {
        if last_index != Some(rec.index) {
            last_index = Some(rec.index);
            entries.push(rec.entry);
        }
    }

    entries
}

/// Group the directory listing into per-family replay plans.
///
/// The dated-suffix convention is recognised first; the numeric one is
/// used when no family shows dated rotations. When neither matches, the
/// plain base files alone are the plan.
#[must_use]
pub fn build_files_to_import(
    list: &[FileEntry],
    patterns: &LogPatterns,
    initial_time: Option<time::OffsetDateTime>,
) -> FileQueues {
    let mut queues = FileQueues::new();

    for kind in 0..2 {
        queues = patterns
            .patterns()
            .iter()
            .map(|pattern| {
                let recognizer = build_recognizer(kind, pattern);
                (
                    pattern.clone(),
                    sorted_entries_for_recognizer(list, &recognizer, initial_time),
                )
            })
            .collect();

        // at least one family with a rotated file means this convention
        // is the one in use
        if queues.values().any(|queue| queue.len() > 1) {
            return queues;
        }
    }

    queues
}
