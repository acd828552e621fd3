// Character-level Myers diff.
//
// Works over Unicode scalar values; offsets elsewhere in this module tree
// count chars, never bytes, so patches survive re-encoding on the wire.

/// One run of the edit script between two texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Equal(String),
    Insert(String),
    Delete(String),
}

impl DiffOp {
    pub fn text(&self) -> &str {
        match self {
            DiffOp::Equal(t) | DiffOp::Insert(t) | DiffOp::Delete(t) => t,
        }
    }

    /// Length of this run in chars.
    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharEdit {
    Equal(char),
    Insert(char),
    Delete(char),
}

/// Compute the edit script from `old_text` to `new_text` as coalesced runs.
///
/// Deletions are ordered before insertions within each changed region, and
/// adjacent runs of the same kind are merged, so the output is canonical.
pub fn diff_main(old_text: &str, new_text: &str) -> Vec<DiffOp> {
    if old_text == new_text {
        if old_text.is_empty() {
            return Vec::new();
        }
        return vec![DiffOp::Equal(old_text.to_owned())];
    }

    let old_chars: Vec<char> = old_text.chars().collect();
    let new_chars: Vec<char> = new_text.chars().collect();
    diff_chars(&old_chars, &new_chars)
}

/// As `diff_main`, but over char slices (the representation patching uses).
pub fn diff_chars(old_chars: &[char], new_chars: &[char]) -> Vec<DiffOp> {
    // Peel off the common prefix and suffix so Myers only sees the middle.
    let prefix = common_prefix(old_chars, new_chars);
    let old_rest = &old_chars[prefix..];
    let new_rest = &new_chars[prefix..];
    let suffix = common_suffix(old_rest, new_rest);

    let old_mid = &old_rest[..old_rest.len() - suffix];
    let new_mid = &new_rest[..new_rest.len() - suffix];

    let mut ops = Vec::new();
    if prefix > 0 {
        ops.push(DiffOp::Equal(old_chars[..prefix].iter().collect()));
    }
    coalesce_into(&mut ops, &myers_char_edits(old_mid, new_mid));
    if suffix > 0 {
        ops.push(DiffOp::Equal(old_rest[old_rest.len() - suffix..].iter().collect()));
    }
    merge_adjacent_equals(ops)
}

fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter().rev().zip(b.iter().rev()).take_while(|(x, y)| x == y).count()
}

/// Greedy Myers O(ND) forward search with a full trace for backtracking.
fn myers_char_edits(old_chars: &[char], new_chars: &[char]) -> Vec<CharEdit> {
    let old_len = old_chars.len();
    let new_len = new_chars.len();

    if old_len == 0 {
        return new_chars.iter().copied().map(CharEdit::Insert).collect();
    }
    if new_len == 0 {
        return old_chars.iter().copied().map(CharEdit::Delete).collect();
    }

    let max = old_len + new_len;
    let offset = max as isize;
    let mut v = vec![0isize; 2 * max + 1];
    let mut trace: Vec<Vec<isize>> = Vec::with_capacity(max + 1);
    let mut solved_d = 0usize;

    'outer: for d in 0..=max {
        trace.push(v.clone());

        let d_isize = d as isize;
        let mut k = -d_isize;
        while k <= d_isize {
            let k_idx = (k + offset) as usize;
            let mut x = if k == -d_isize
                || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
            {
                v[(k + 1 + offset) as usize]
            } else {
                v[(k - 1 + offset) as usize] + 1
            };
            let mut y = x - k;

            while x < old_len as isize
                && y < new_len as isize
                && old_chars[x as usize] == new_chars[y as usize]
            {
                x += 1;
                y += 1;
            }

            v[k_idx] = x;

            if x >= old_len as isize && y >= new_len as isize {
                solved_d = d;
                break 'outer;
            }

            k += 2;
        }
    }

    backtrack_char_edits(old_chars, new_chars, &trace, solved_d, offset)
}

fn backtrack_char_edits(
    old_chars: &[char],
    new_chars: &[char],
    trace: &[Vec<isize>],
    solved_d: usize,
    offset: isize,
) -> Vec<CharEdit> {
    let mut edits = Vec::new();
    let mut x = old_chars.len() as isize;
    let mut y = new_chars.len() as isize;

    for d in (0..=solved_d).rev() {
        let v = &trace[d];
        let k = x - y;
        let d_isize = d as isize;

        let prev_k = if d == 0 {
            0
        } else if k == -d_isize
            || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { v[(prev_k + offset) as usize] };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(CharEdit::Equal(old_chars[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }

        if d == 0 {
            break;
        }

        if x == prev_x {
            edits.push(CharEdit::Insert(new_chars[(y - 1) as usize]));
            y -= 1;
        } else {
            edits.push(CharEdit::Delete(old_chars[(x - 1) as usize]));
            x -= 1;
        }
    }

    edits.reverse();
    edits
}

/// Coalesce per-char edits into runs, normalizing each changed region to
/// delete-before-insert order.
fn coalesce_into(ops: &mut Vec<DiffOp>, edits: &[CharEdit]) {
    let mut equal = String::new();
    let mut deleted = String::new();
    let mut inserted = String::new();

    let flush_changes =
        |ops: &mut Vec<DiffOp>, deleted: &mut String, inserted: &mut String| {
            if !deleted.is_empty() {
                ops.push(DiffOp::Delete(std::mem::take(deleted)));
            }
            if !inserted.is_empty() {
                ops.push(DiffOp::Insert(std::mem::take(inserted)));
            }
        };

    for edit in edits {
        match edit {
            CharEdit::Equal(ch) => {
                flush_changes(ops, &mut deleted, &mut inserted);
                equal.push(*ch);
            }
            CharEdit::Delete(ch) => {
                if !equal.is_empty() {
                    ops.push(DiffOp::Equal(std::mem::take(&mut equal)));
                }
                deleted.push(*ch);
            }
            CharEdit::Insert(ch) => {
                if !equal.is_empty() {
                    ops.push(DiffOp::Equal(std::mem::take(&mut equal)));
                }
                inserted.push(*ch);
            }
        }
    }

    flush_changes(ops, &mut deleted, &mut inserted);
    if !equal.is_empty() {
        ops.push(DiffOp::Equal(equal));
    }
}

fn merge_adjacent_equals(ops: Vec<DiffOp>) -> Vec<DiffOp> {
    let mut merged: Vec<DiffOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match (merged.last_mut(), &op) {
            (Some(DiffOp::Equal(prev)), DiffOp::Equal(next)) => prev.push_str(next),
            _ => merged.push(op),
        }
    }
    merged
}
