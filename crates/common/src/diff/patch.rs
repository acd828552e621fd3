// Context-hunk patches in the diff-match-patch text format, with fuzzy
// (bitap) application.
//
// Offsets and lengths count chars. Hunk coordinates in the serialized form
// are 1-based with the length omitted when it is exactly one, matching the
// format editors already speak.

use std::collections::HashMap;

use thiserror::Error;

use super::myers::{diff_chars, diff_main, DiffOp};

/// Chars of context captured on each side of a hunk.
const PATCH_MARGIN: usize = 4;
/// Longest pattern the bitap matcher can handle (bits in the match mask).
const MATCH_MAX_BITS: usize = 64;
/// Worst acceptable match score; above this a hunk fails to anchor.
const MATCH_THRESHOLD: f64 = 0.5;
/// Distance (in chars) over which the proximity penalty reaches 1.0.
const MATCH_DISTANCE: usize = 1000;
/// Worst acceptable error ratio when replaying a long hunk onto drifted text.
const DELETE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed hunk header: {0:?}")]
    Header(String),
    #[error("malformed patch line: {0:?}")]
    Line(String),
    #[error("invalid percent encoding: {0:?}")]
    Encoding(String),
}

/// One hunk: an edit script plus the coordinates it was cut from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchHunk {
    pub diffs: Vec<DiffOp>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

/// Diff `old_text` against `new_text` and serialize the result as patch
/// text. Returns the empty string iff the inputs are equal.
pub fn create_patch(old_text: &str, new_text: &str) -> String {
    let diffs = diff_main(old_text, new_text);
    let hunks = make_hunks(old_text, &diffs);
    hunks_to_text(&hunks)
}

/// Apply patch text to `text` with fuzzy anchoring.
///
/// Returns the patched text and one flag per hunk; failed hunks are skipped
/// and the rest still apply. Only unparseable patch text is an error.
pub fn apply_patch(text: &str, patch_text: &str) -> Result<(String, Vec<bool>), PatchError> {
    let hunks = hunks_from_text(patch_text)?;
    Ok(apply_hunks(&hunks, text))
}

// ── Hunk construction ──────────────────────────────────────────────

/// Group an edit script into context hunks against `text1` (the old text).
pub fn make_hunks(text1: &str, diffs: &[DiffOp]) -> Vec<PatchHunk> {
    let mut hunks = Vec::new();
    if diffs.is_empty() {
        return hunks;
    }

    let mut patch = PatchHunk::default();
    let mut char_count1 = 0usize;
    let mut char_count2 = 0usize;
    // prepatch tracks text1 up to the last completed hunk; postpatch tracks
    // the text with all edits seen so far applied. Context for a hunk is
    // always cut from prepatch so coordinates line up at apply time.
    let mut prepatch: Vec<char> = text1.chars().collect();
    let mut postpatch: Vec<char> = prepatch.clone();
    let last = diffs.len() - 1;

    for (i, op) in diffs.iter().enumerate() {
        let op_len = op.char_len();
        if patch.diffs.is_empty() && !matches!(op, DiffOp::Equal(_)) {
            patch.start1 = char_count1;
            patch.start2 = char_count2;
        }

        match op {
            DiffOp::Insert(data) => {
                patch.diffs.push(op.clone());
                patch.length2 += op_len;
                postpatch.splice(char_count2..char_count2, data.chars());
            }
            DiffOp::Delete(_) => {
                patch.diffs.push(op.clone());
                patch.length1 += op_len;
                postpatch.splice(char_count2..char_count2 + op_len, std::iter::empty());
            }
            DiffOp::Equal(_) => {
                if op_len <= 2 * PATCH_MARGIN && !patch.diffs.is_empty() && i != last {
                    // Small equality: keep it inside the current hunk.
                    patch.diffs.push(op.clone());
                    patch.length1 += op_len;
                    patch.length2 += op_len;
                } else if op_len >= 2 * PATCH_MARGIN && !patch.diffs.is_empty() {
                    // Large equality: close the hunk here.
                    add_context(&mut patch, &prepatch);
                    hunks.push(std::mem::take(&mut patch));
                    prepatch = postpatch.clone();
                    char_count1 = char_count2;
                }
            }
        }

        if !matches!(op, DiffOp::Insert(_)) {
            char_count1 += op_len;
        }
        if !matches!(op, DiffOp::Delete(_)) {
            char_count2 += op_len;
        }
    }

    if !patch.diffs.is_empty() {
        add_context(&mut patch, &prepatch);
        hunks.push(patch);
    }
    hunks
}

/// Grow a hunk with surrounding context until the pattern is unique in
/// `text` (or the bitap limit is reached), then pad by the margin.
fn add_context(patch: &mut PatchHunk, text: &[char]) {
    let pattern_from = patch.start2.min(text.len());
    let pattern_to = (patch.start2 + patch.length1).min(text.len());
    let mut pattern: Vec<char> = text[pattern_from..pattern_to].to_vec();

    let mut padding = 0usize;
    while find_sub(text, &pattern, 0) != rfind_sub(text, &pattern, text.len())
        && pattern.len() < MATCH_MAX_BITS - 2 * PATCH_MARGIN
    {
        padding += PATCH_MARGIN;
        let from = patch.start2.saturating_sub(padding);
        let to = (patch.start2 + patch.length1 + padding).min(text.len());
        pattern = text[from.min(text.len())..to].to_vec();
    }
    padding += PATCH_MARGIN;

    let prefix_from = patch.start2.saturating_sub(padding);
    let prefix: Vec<char> = text[prefix_from..pattern_from].to_vec();
    let suffix_to = (patch.start2 + patch.length1 + padding).min(text.len());
    let suffix: Vec<char> = text[pattern_to..suffix_to].to_vec();

    if !prefix.is_empty() {
        patch.diffs.insert(0, DiffOp::Equal(prefix.iter().collect()));
    }
    if !suffix.is_empty() {
        patch.diffs.push(DiffOp::Equal(suffix.iter().collect()));
    }

    patch.start1 -= prefix.len();
    patch.start2 -= prefix.len();
    patch.length1 += prefix.len() + suffix.len();
    patch.length2 += prefix.len() + suffix.len();
}

// ── Text format ────────────────────────────────────────────────────

/// Serialize hunks to patch text.
pub fn hunks_to_text(hunks: &[PatchHunk]) -> String {
    let mut out = String::new();
    for hunk in hunks {
        out.push_str(&format!(
            "@@ -{} +{} @@\n",
            format_coords(hunk.start1, hunk.length1),
            format_coords(hunk.start2, hunk.length2)
        ));
        for op in &hunk.diffs {
            let sign = match op {
                DiffOp::Equal(_) => ' ',
                DiffOp::Insert(_) => '+',
                DiffOp::Delete(_) => '-',
            };
            out.push(sign);
            out.push_str(&uri_encode(op.text()));
            out.push('\n');
        }
    }
    out
}

fn format_coords(start: usize, length: usize) -> String {
    match length {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, length),
    }
}

/// Parse patch text back into hunks. Lengths are recomputed from the hunk
/// bodies so inconsistent headers cannot skew application.
pub fn hunks_from_text(patch_text: &str) -> Result<Vec<PatchHunk>, PatchError> {
    let mut hunks: Vec<PatchHunk> = Vec::new();
    if patch_text.is_empty() {
        return Ok(hunks);
    }

    for line in patch_text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix("@@ ") {
            hunks.push(parse_header(header, line)?);
            continue;
        }

        let Some(hunk) = hunks.last_mut() else {
            return Err(PatchError::Line(preview(line)));
        };
        let sign = line.as_bytes()[0];
        if !matches!(sign, b' ' | b'-' | b'+') {
            return Err(PatchError::Line(preview(line)));
        }
        let body = uri_decode(&line[1..])?;
        let body_len = body.chars().count();
        match sign {
            b' ' => {
                hunk.length1 += body_len;
                hunk.length2 += body_len;
                hunk.diffs.push(DiffOp::Equal(body));
            }
            b'-' => {
                hunk.length1 += body_len;
                hunk.diffs.push(DiffOp::Delete(body));
            }
            _ => {
                hunk.length2 += body_len;
                hunk.diffs.push(DiffOp::Insert(body));
            }
        }
    }

    Ok(hunks)
}

fn parse_header(header: &str, line: &str) -> Result<PatchHunk, PatchError> {
    let header = header.strip_suffix(" @@").ok_or_else(|| PatchError::Header(preview(line)))?;
    let mut parts = header.split(' ');
    let old_part = parts.next().and_then(|p| p.strip_prefix('-'));
    let new_part = parts.next().and_then(|p| p.strip_prefix('+'));
    let (Some(old_part), Some(new_part), None) = (old_part, new_part, parts.next()) else {
        return Err(PatchError::Header(preview(line)));
    };

    let (start1, _) = parse_coords(old_part).ok_or_else(|| PatchError::Header(preview(line)))?;
    let (start2, _) = parse_coords(new_part).ok_or_else(|| PatchError::Header(preview(line)))?;
    Ok(PatchHunk { diffs: Vec::new(), start1, start2, length1: 0, length2: 0 })
}

/// Decode one side of a hunk header: `n` means start n-1, length 1;
/// `n,0` means start n, length 0; `n,m` means start n-1, length m.
fn parse_coords(part: &str) -> Option<(usize, usize)> {
    match part.split_once(',') {
        None => {
            let start: usize = part.parse().ok()?;
            Some((start.checked_sub(1)?, 1))
        }
        Some((start, "0")) => Some((start.parse().ok()?, 0)),
        Some((start, length)) => {
            let start: usize = start.parse().ok()?;
            let length: usize = length.parse().ok()?;
            Some((start.checked_sub(1)?, length))
        }
    }
}

fn preview(line: &str) -> String {
    line.chars().take(32).collect()
}

fn uri_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || " !#$&'()*+,-./:;=?@_~".contains(ch) {
            out.push(ch);
        } else {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

fn uri_decode(text: &str) -> Result<String, PatchError> {
    let mut bytes = Vec::with_capacity(text.len());
    let mut cursor = text.as_bytes().iter();
    while let Some(&byte) = cursor.next() {
        if byte != b'%' {
            bytes.push(byte);
            continue;
        }
        let hi = cursor.next().and_then(|b| (*b as char).to_digit(16));
        let lo = cursor.next().and_then(|b| (*b as char).to_digit(16));
        match (hi, lo) {
            (Some(hi), Some(lo)) => bytes.push((hi * 16 + lo) as u8),
            _ => return Err(PatchError::Encoding(preview(text))),
        }
    }
    String::from_utf8(bytes).map_err(|_| PatchError::Encoding(preview(text)))
}

// ── Application ────────────────────────────────────────────────────

/// Replay hunks onto `text`, returning the result and per-hunk success.
pub fn apply_hunks(hunks: &[PatchHunk], text: &str) -> (String, Vec<bool>) {
    if hunks.is_empty() {
        return (text.to_owned(), Vec::new());
    }

    let mut hunks: Vec<PatchHunk> = hunks.to_vec();
    let null_padding = add_padding(&mut hunks);
    let mut text: Vec<char> = null_padding
        .iter()
        .copied()
        .chain(text.chars())
        .chain(null_padding.iter().copied())
        .collect();

    let mut results = vec![false; hunks.len()];
    let mut delta: isize = 0;
    for (x, hunk) in hunks.iter().enumerate() {
        let expected_loc = (hunk.start2 as isize + delta).max(0) as usize;
        let text1 = diff_side1(&hunk.diffs);

        let mut end_loc: Option<usize> = None;
        let start_loc = if text1.len() > MATCH_MAX_BITS {
            // Too long for one bitap pass: anchor the head and tail
            // independently and require them to agree.
            match match_main(&text, &text1[..MATCH_MAX_BITS], expected_loc) {
                Some(head_loc) => {
                    let tail_expected = expected_loc + text1.len() - MATCH_MAX_BITS;
                    end_loc =
                        match_main(&text, &text1[text1.len() - MATCH_MAX_BITS..], tail_expected);
                    match end_loc {
                        Some(e) if head_loc < e => Some(head_loc),
                        _ => None,
                    }
                }
                None => None,
            }
        } else {
            match_main(&text, &text1, expected_loc)
        };

        let Some(start_loc) = start_loc else {
            // No anchor; undo this hunk's contribution to the offset drift.
            delta -= hunk.length2 as isize - hunk.length1 as isize;
            continue;
        };

        results[x] = true;
        delta = start_loc as isize - expected_loc as isize;
        let found_end = match end_loc {
            Some(e) => (e + MATCH_MAX_BITS).min(text.len()),
            None => (start_loc + text1.len()).min(text.len()),
        };
        let found: Vec<char> = text[start_loc.min(text.len())..found_end].to_vec();

        if text1 == found {
            let replacement = diff_side2(&hunk.diffs);
            text.splice(start_loc..found_end, replacement);
        } else {
            // The base drifted inside the hunk: map every edit through a
            // diff between what we expected and what is actually there.
            let bridge = diff_chars(&text1, &found);
            if text1.len() > MATCH_MAX_BITS
                && levenshtein(&bridge) as f64 / text1.len() as f64 > DELETE_THRESHOLD
            {
                results[x] = false;
                continue;
            }

            let mut index1 = 0usize;
            for op in &hunk.diffs {
                match op {
                    DiffOp::Equal(data) => {
                        index1 += data.chars().count();
                    }
                    DiffOp::Insert(data) => {
                        let index2 = x_index(&bridge, index1);
                        let at = (start_loc + index2).min(text.len());
                        text.splice(at..at, data.chars());
                        index1 += data.chars().count();
                    }
                    DiffOp::Delete(data) => {
                        let from = (start_loc + x_index(&bridge, index1)).min(text.len());
                        let to = (start_loc + x_index(&bridge, index1 + data.chars().count()))
                            .min(text.len())
                            .max(from);
                        text.splice(from..to, std::iter::empty());
                    }
                }
            }
        }
    }

    let pad = null_padding.len();
    let inner: String = text[pad..text.len() - pad].iter().collect();
    (inner, results)
}

/// Pad the text and the edge hunks so matches near the boundaries still
/// have full context. Returns the padding that was applied.
fn add_padding(hunks: &mut [PatchHunk]) -> Vec<char> {
    let padding: Vec<char> = (1..=PATCH_MARGIN as u32).filter_map(char::from_u32).collect();
    let pad_len = padding.len();

    for hunk in hunks.iter_mut() {
        hunk.start1 += pad_len;
        hunk.start2 += pad_len;
    }

    if let Some(first) = hunks.first_mut() {
        match first.diffs.first_mut() {
            Some(DiffOp::Equal(context)) => {
                let context_len = context.chars().count();
                if context_len < pad_len {
                    let extra = pad_len - context_len;
                    let lead: String = padding[context_len..].iter().collect();
                    context.insert_str(0, &lead);
                    first.start1 -= extra;
                    first.start2 -= extra;
                    first.length1 += extra;
                    first.length2 += extra;
                }
            }
            _ => {
                first.diffs.insert(0, DiffOp::Equal(padding.iter().collect()));
                first.start1 -= pad_len;
                first.start2 -= pad_len;
                first.length1 += pad_len;
                first.length2 += pad_len;
            }
        }
    }

    if let Some(last) = hunks.last_mut() {
        match last.diffs.last_mut() {
            Some(DiffOp::Equal(context)) => {
                let context_len = context.chars().count();
                if context_len < pad_len {
                    let tail: String = padding[..pad_len - context_len].iter().collect();
                    context.push_str(&tail);
                    last.length1 += pad_len - context_len;
                    last.length2 += pad_len - context_len;
                }
            }
            _ => {
                last.diffs.push(DiffOp::Equal(padding.iter().collect()));
                last.length1 += pad_len;
                last.length2 += pad_len;
            }
        }
    }

    padding
}

/// The old-side text of a hunk (equalities and deletions).
fn diff_side1(diffs: &[DiffOp]) -> Vec<char> {
    diffs
        .iter()
        .filter(|op| !matches!(op, DiffOp::Insert(_)))
        .flat_map(|op| op.text().chars())
        .collect()
}

/// The new-side text of a hunk (equalities and insertions).
fn diff_side2(diffs: &[DiffOp]) -> Vec<char> {
    diffs
        .iter()
        .filter(|op| !matches!(op, DiffOp::Delete(_)))
        .flat_map(|op| op.text().chars())
        .collect()
}

/// Map a char offset on the old side of `diffs` to the new side.
fn x_index(diffs: &[DiffOp], loc: usize) -> usize {
    let mut chars1 = 0usize;
    let mut chars2 = 0usize;
    let mut last_chars1 = 0usize;
    let mut last_chars2 = 0usize;
    let mut hit: Option<&DiffOp> = None;

    for op in diffs {
        let len = op.char_len();
        if !matches!(op, DiffOp::Insert(_)) {
            chars1 += len;
        }
        if !matches!(op, DiffOp::Delete(_)) {
            chars2 += len;
        }
        if chars1 > loc {
            hit = Some(op);
            break;
        }
        last_chars1 = chars1;
        last_chars2 = chars2;
    }

    if matches!(hit, Some(DiffOp::Delete(_))) {
        // Inside a deletion there is no new-side position; snap left.
        return last_chars2;
    }
    last_chars2 + (loc - last_chars1)
}

/// Edit cost of a script: the larger of insertions/deletions per region.
fn levenshtein(diffs: &[DiffOp]) -> usize {
    let mut total = 0usize;
    let mut insertions = 0usize;
    let mut deletions = 0usize;
    for op in diffs {
        match op {
            DiffOp::Insert(_) => insertions += op.char_len(),
            DiffOp::Delete(_) => deletions += op.char_len(),
            DiffOp::Equal(_) => {
                total += insertions.max(deletions);
                insertions = 0;
                deletions = 0;
            }
        }
    }
    total + insertions.max(deletions)
}

// ── Fuzzy location ─────────────────────────────────────────────────

/// Locate `pattern` in `text` near `loc`, tolerating errors.
fn match_main(text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    let loc = loc.min(text.len());
    if pattern.is_empty() {
        return Some(loc);
    }
    if text.is_empty() {
        return None;
    }
    if loc + pattern.len() <= text.len() && text[loc..loc + pattern.len()] == *pattern {
        return Some(loc);
    }
    match_bitap(text, pattern, loc)
}

fn match_bitap(text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    if pattern.len() > MATCH_MAX_BITS {
        return None;
    }

    let alphabet = bitap_alphabet(pattern);
    let mut score_threshold = MATCH_THRESHOLD;

    // Exact occurrences, if any, tighten the score ceiling up front.
    if let Some(exact) = find_sub(text, pattern, loc) {
        score_threshold = bitap_score(0, exact, loc, pattern.len()).min(score_threshold);
        if let Some(exact_back) = rfind_sub(text, pattern, loc + pattern.len()) {
            score_threshold =
                bitap_score(0, exact_back, loc, pattern.len()).min(score_threshold);
        }
    }

    let match_mask: u64 = 1 << (pattern.len() - 1);
    let mut best_loc: Option<usize> = None;
    let mut bin_max = pattern.len() + text.len();
    let mut last_rd: Vec<u64> = Vec::new();

    for d in 0..pattern.len() {
        // Binary-search the widest radius still within the score ceiling
        // at this error level.
        let mut bin_min = 0usize;
        let mut bin_mid = bin_max;
        while bin_min < bin_mid {
            if bitap_score(d, loc + bin_mid, loc, pattern.len()) <= score_threshold {
                bin_min = bin_mid;
            } else {
                bin_max = bin_mid;
            }
            bin_mid = (bin_max - bin_min) / 2 + bin_min;
        }
        bin_max = bin_mid;

        let mut start = (loc as isize - bin_mid as isize + 1).max(1) as usize;
        let finish = (loc + bin_mid).min(text.len()) + pattern.len();
        let mut rd = vec![0u64; finish + 2];
        rd[finish + 1] = (1u64 << d) - 1;

        let mut j = finish;
        while j >= start {
            let char_match = if j - 1 < text.len() {
                alphabet.get(&text[j - 1]).copied().unwrap_or(0)
            } else {
                0
            };

            rd[j] = if d == 0 {
                ((rd[j + 1] << 1) | 1) & char_match
            } else {
                (((rd[j + 1] << 1) | 1) & char_match)
                    | (((prev_rd(&last_rd, j + 1) | prev_rd(&last_rd, j)) << 1) | 1)
                    | prev_rd(&last_rd, j + 1)
            };

            if rd[j] & match_mask != 0 {
                let score = bitap_score(d, j - 1, loc, pattern.len());
                if score <= score_threshold {
                    score_threshold = score;
                    best_loc = Some(j - 1);
                    if j - 1 > loc {
                        // Keep scanning toward loc for a closer candidate.
                        start = (2 * loc as isize - (j - 1) as isize).max(1) as usize;
                    } else {
                        break;
                    }
                }
            }
            j -= 1;
        }

        if bitap_score(d + 1, loc, loc, pattern.len()) > score_threshold {
            break;
        }
        last_rd = rd;
    }

    best_loc
}

fn prev_rd(last_rd: &[u64], index: usize) -> u64 {
    last_rd.get(index).copied().unwrap_or(0)
}

fn bitap_score(errors: usize, candidate: usize, loc: usize, pattern_len: usize) -> f64 {
    let accuracy = errors as f64 / pattern_len as f64;
    let proximity = (loc as isize - candidate as isize).unsigned_abs();
    if MATCH_DISTANCE == 0 {
        return if proximity == 0 { accuracy } else { 1.0 };
    }
    accuracy + proximity as f64 / MATCH_DISTANCE as f64
}

fn bitap_alphabet(pattern: &[char]) -> HashMap<char, u64> {
    let mut alphabet = HashMap::new();
    for (i, &ch) in pattern.iter().enumerate() {
        *alphabet.entry(ch).or_insert(0) |= 1u64 << (pattern.len() - i - 1);
    }
    alphabet
}

fn find_sub(text: &[char], pattern: &[char], from: usize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(from.min(text.len()));
    }
    if text.len() < pattern.len() {
        return None;
    }
    (from.min(text.len())..=text.len() - pattern.len())
        .find(|&i| text[i..i + pattern.len()] == *pattern)
}

fn rfind_sub(text: &[char], pattern: &[char], until: usize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(until.min(text.len()));
    }
    if text.len() < pattern.len() {
        return None;
    }
    let max_start = (text.len() - pattern.len()).min(until);
    (0..=max_start).rev().find(|&i| text[i..i + pattern.len()] == *pattern)
}
