//! Reversible character-level text patches.
//!
//! [`diff`] produces a [`Patch`]: a list of [`Hunk`]s, each carrying the
//! char offset where it applied in the source text and a run of
//! equal/delete/insert ops padded with a little context. [`apply`] replays
//! the hunks on a text that may have drifted from the original source:
//! every hunk is first tried at its expected offset, then relocated to the
//! nearest exact occurrence of its source pattern, and skipped when it
//! cannot be found. Skipped hunks are reported through [`Applied::clean`];
//! application never fails.
//!
//! Edits store the *undo* patch, `diff(new_text, previous_text)`, so that
//! history can be rewound one edit at a time (see [`crate::history`]).

use serde::{Deserialize, Serialize};

/// Context chars kept on each side of a change.
const CONTEXT_CHARS: usize = 4;

/// Upper bound for context widening when a hunk pattern is ambiguous.
const MAX_CONTEXT_CHARS: usize = 32;

/// Edit distance beyond which the Myers search gives up and the remaining
/// middle section is encoded as one delete + insert.
const MAX_EDIT_DISTANCE: usize = 2048;

/// A single diff operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "text", rename_all = "lowercase")]
pub enum Op {
    Equal(String),
    Delete(String),
    Insert(String),
}

impl Op {
    fn text(&self) -> &str {
        match self {
            Op::Equal(t) | Op::Delete(t) | Op::Insert(t) => t,
        }
    }
}

/// A contiguous region of change plus its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Char offset of the hunk's first op in the source text.
    pub start: usize,
    pub ops: Vec<Op>,
}

impl Hunk {
    /// Text this hunk expects to find (equal + deleted runs).
    pub fn source(&self) -> String {
        self.ops
            .iter()
            .filter(|op| !matches!(op, Op::Insert(_)))
            .map(Op::text)
            .collect()
    }

    /// Text this hunk leaves behind (equal + inserted runs).
    pub fn target(&self) -> String {
        self.ops
            .iter()
            .filter(|op| !matches!(op, Op::Delete(_)))
            .map(Op::text)
            .collect()
    }
}

/// An opaque, serializable set of hunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn hunk_count(&self) -> usize {
        self.hunks.len()
    }
}

/// Result of [`apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    /// `false` when at least one hunk could not be located and was skipped.
    pub clean: bool,
}

/// Compute the patch that turns `from` into `to`.
pub fn diff(from: &str, to: &str) -> Patch {
    let a: Vec<char> = from.chars().collect();
    let b: Vec<char> = to.chars().collect();
    let ops = diff_ops(&a, &b);
    Patch {
        hunks: build_hunks(&a, &ops),
    }
}

/// Apply `patch` to `text`, best-effort.
pub fn apply(patch: &Patch, text: &str) -> Applied {
    let mut chars: Vec<char> = text.chars().collect();
    let mut clean = true;
    // Shift between where hunks expected to land and where they landed.
    let mut delta: isize = 0;

    for (i, hunk) in patch.hunks.iter().enumerate() {
        let pattern: Vec<char> = hunk.source().chars().collect();
        let replacement: Vec<char> = hunk.target().chars().collect();
        let expected = (hunk.start as isize + delta).clamp(0, chars.len() as isize) as usize;

        let location = if matches_at(&chars, &pattern, expected) {
            Some(expected)
        } else {
            nearest_occurrence(&chars, &pattern, expected)
        };

        match location {
            Some(loc) => {
                chars.splice(loc..loc + pattern.len(), replacement.iter().copied());
                delta = loc as isize - hunk.start as isize + replacement.len() as isize
                    - pattern.len() as isize;
            }
            None => {
                tracing::debug!(hunk = i, start = hunk.start, "patch hunk did not locate");
                clean = false;
            }
        }
    }

    Applied {
        text: chars.into_iter().collect(),
        clean,
    }
}

fn matches_at(text: &[char], pattern: &[char], at: usize) -> bool {
    at + pattern.len() <= text.len() && text[at..at + pattern.len()] == *pattern
}

fn nearest_occurrence(text: &[char], pattern: &[char], expected: usize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(expected.min(text.len()));
    }
    if pattern.len() > text.len() {
        return None;
    }
    (0..=text.len() - pattern.len())
        .filter(|&i| text[i..i + pattern.len()] == *pattern)
        .min_by_key(|&i| i.abs_diff(expected))
}

fn count_occurrences(text: &[char], pattern: &[char]) -> usize {
    if pattern.is_empty() || pattern.len() > text.len() {
        return 0;
    }
    text.windows(pattern.len()).filter(|w| *w == pattern).count()
}

// ─── Diff ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal(char),
    Delete(char),
    Insert(char),
}

fn diff_ops(a: &[char], b: &[char]) -> Vec<Op> {
    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];

    let mut edits: Vec<Edit> = a[..prefix].iter().map(|&c| Edit::Equal(c)).collect();
    match myers(mid_a, mid_b) {
        Some(middle) => edits.extend(middle),
        None => {
            tracing::debug!(
                from_len = mid_a.len(),
                to_len = mid_b.len(),
                "edit distance too large, falling back to replace"
            );
            edits.extend(mid_a.iter().map(|&c| Edit::Delete(c)));
            edits.extend(mid_b.iter().map(|&c| Edit::Insert(c)));
        }
    }
    edits.extend(a[a.len() - suffix..].iter().map(|&c| Edit::Equal(c)));

    coalesce(&edits)
}

/// Myers' O(ND) shortest edit script. Returns `None` past [`MAX_EDIT_DISTANCE`].
fn myers(a: &[char], b: &[char]) -> Option<Vec<Edit>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    let limit = max.min(MAX_EDIT_DISTANCE);
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    // trace[d] holds v[-(d+1)..=(d+1)] as it was before step d.
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=limit as isize {
        let lo = (offset - d - 1) as usize;
        let hi = (offset + d + 1) as usize;
        trace.push(v[lo..=hi].to_vec());

        let mut k = -d;
        while k <= d {
            let idx = (offset + k) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && x >= 0 && y >= 0 && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x == n && y == m {
                return Some(backtrack(a, b, &trace));
            }
            k += 2;
        }
    }
    None
}

fn backtrack(a: &[char], b: &[char], trace: &[Vec<isize>]) -> Vec<Edit> {
    let mut x = a.len() as isize;
    let mut y = b.len() as isize;
    let mut edits = Vec::new();

    for (d, snapshot) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let get = |k: isize| snapshot[(k + d + 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && get(k - 1) < get(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = get(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal(a[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit::Insert(b[prev_y as usize]));
            } else {
                edits.push(Edit::Delete(a[prev_x as usize]));
            }
        }
        x = prev_x;
        y = prev_y;
    }

    edits.reverse();
    edits
}

fn coalesce(edits: &[Edit]) -> Vec<Op> {
    let mut ops: Vec<Op> = Vec::new();
    for edit in edits {
        match (ops.last_mut(), edit) {
            (Some(Op::Equal(s)), Edit::Equal(c))
            | (Some(Op::Delete(s)), Edit::Delete(c))
            | (Some(Op::Insert(s)), Edit::Insert(c)) => s.push(*c),
            (_, Edit::Equal(c)) => ops.push(Op::Equal(c.to_string())),
            (_, Edit::Delete(c)) => ops.push(Op::Delete(c.to_string())),
            (_, Edit::Insert(c)) => ops.push(Op::Insert(c.to_string())),
        }
    }
    ops
}

// ─── Hunks ─────────────────────────────────────────────────────────────

fn build_hunks(source: &[char], ops: &[Op]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut pos = 0usize;

    for (i, op) in ops.iter().enumerate() {
        let len = op.text().chars().count();
        match op {
            Op::Equal(text) => {
                if let Some(mut hunk) = current.take() {
                    let is_last = i + 1 == ops.len();
                    if len > 2 * CONTEXT_CHARS || is_last {
                        let ctx: String = text.chars().take(CONTEXT_CHARS).collect();
                        if !ctx.is_empty() {
                            hunk.ops.push(Op::Equal(ctx));
                        }
                        hunks.push(hunk);
                    } else {
                        hunk.ops.push(op.clone());
                        current = Some(hunk);
                    }
                }
                pos += len;
            }
            Op::Delete(_) | Op::Insert(_) => {
                let hunk = current.get_or_insert_with(|| {
                    let ctx_start = pos.saturating_sub(CONTEXT_CHARS);
                    let ctx: String = source[ctx_start..pos].iter().collect();
                    let ops = if ctx.is_empty() {
                        Vec::new()
                    } else {
                        vec![Op::Equal(ctx)]
                    };
                    Hunk {
                        start: ctx_start,
                        ops,
                    }
                });
                hunk.ops.push(op.clone());
                if matches!(op, Op::Delete(_)) {
                    pos += len;
                }
            }
        }
    }
    if let Some(hunk) = current {
        hunks.push(hunk);
    }

    // Neighbouring hunks must stay disjoint in the source, so each one may
    // only widen into the gap between its neighbours.
    for i in 0..hunks.len() {
        let lower = match i {
            0 => 0,
            _ => hunks[i - 1].start + hunks[i - 1].source().chars().count(),
        };
        let upper = hunks.get(i + 1).map_or(source.len(), |h| h.start);
        widen_until_unique(source, &mut hunks[i], lower, upper);
    }
    hunks
}

/// Grow a hunk's context until its source pattern occurs once in `source`.
fn widen_until_unique(source: &[char], hunk: &mut Hunk, lower: usize, upper: usize) {
    let mut added = 0;
    loop {
        let pattern: Vec<char> = hunk.source().chars().collect();
        if count_occurrences(source, &pattern) <= 1 || added >= MAX_CONTEXT_CHARS {
            return;
        }
        let end = hunk.start + pattern.len();
        let new_start = hunk.start.saturating_sub(CONTEXT_CHARS).max(lower);
        let new_end = (end + CONTEXT_CHARS).min(upper);
        if new_start == hunk.start && new_end == end {
            return;
        }

        let before: String = source[new_start..hunk.start].iter().collect();
        let after: String = source[end..new_end].iter().collect();

        if !before.is_empty() {
            match hunk.ops.first_mut() {
                Some(Op::Equal(s)) => s.insert_str(0, &before),
                _ => hunk.ops.insert(0, Op::Equal(before)),
            }
        }
        if !after.is_empty() {
            match hunk.ops.last_mut() {
                Some(Op::Equal(s)) => s.push_str(&after),
                _ => hunk.ops.push(Op::Equal(after)),
            }
        }
        hunk.start = new_start;
        added += CONTEXT_CHARS;
    }
}
