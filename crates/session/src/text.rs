/// Text edit operations on the shared document and their transformation
///
/// Positions and lengths count Unicode scalar values, not bytes. A batch is a
/// `Vec<TextOp>` applied in order, each op addressing the text left by the
/// previous one.
use serde::{Deserialize, Serialize};

use crate::{Result, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TextOp {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

/// Which side wins when two concurrent inserts land on the same position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    /// The transformed insert stays before the other one
    Left,
    /// The transformed insert moves after the other one
    Right,
}

impl Bias {
    pub fn flip(self) -> Self {
        match self {
            Bias::Left => Bias::Right,
            Bias::Right => Bias::Left,
        }
    }
}

impl TextOp {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        TextOp::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        TextOp::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            TextOp::Insert { position, .. } | TextOp::Delete { position, .. } => *position,
        }
    }

    pub fn is_noop(&self) -> bool {
        match self {
            TextOp::Insert { text, .. } => text.is_empty(),
            TextOp::Delete { length, .. } => *length == 0,
        }
    }

    /// Apply to `content`; on error `content` is left untouched
    pub fn apply(&self, content: &mut String) -> Result<()> {
        let len = content.chars().count();
        match self {
            TextOp::Insert { position, text } => {
                if *position > len {
                    return Err(SessionError::PositionOutOfBounds {
                        position: *position,
                        len,
                    });
                }
                let at = byte_offset(content, *position);
                content.insert_str(at, text);
            }
            TextOp::Delete { position, length } => {
                let end = position + length;
                if end > len {
                    return Err(SessionError::RangeOutOfBounds {
                        position: *position,
                        end,
                        len,
                    });
                }
                let start = byte_offset(content, *position);
                let stop = byte_offset(content, end);
                content.replace_range(start..stop, "");
            }
        }
        Ok(())
    }

    /// Rewrite this op so it applies after `other`, both defined on the same text.
    ///
    /// Returns zero ops when `other` already removed everything this op touched,
    /// two when a delete spans text inserted by `other`.
    pub fn transform(&self, other: &TextOp, bias: Bias) -> Vec<TextOp> {
        let transformed = match (self, other) {
            (
                TextOp::Insert { position, text },
                TextOp::Insert {
                    position: other_pos,
                    text: other_text,
                },
            ) => {
                let shift = *other_pos < *position
                    || (*other_pos == *position && bias == Bias::Right && !other_text.is_empty());
                let position = if shift {
                    position + char_len(other_text)
                } else {
                    *position
                };
                vec![TextOp::insert(position, text.clone())]
            }

            (
                TextOp::Insert { position, text },
                TextOp::Delete {
                    position: del_pos,
                    length: del_len,
                },
            ) => {
                let position = if *position <= *del_pos {
                    *position
                } else if *position >= del_pos + del_len {
                    position - del_len
                } else {
                    *del_pos
                };
                vec![TextOp::insert(position, text.clone())]
            }

            (
                TextOp::Delete { position, length },
                TextOp::Insert {
                    position: ins_pos,
                    text,
                },
            ) => {
                let inserted = char_len(text);
                if *ins_pos >= position + length {
                    vec![self.clone()]
                } else if *ins_pos <= *position {
                    vec![TextOp::delete(position + inserted, *length)]
                } else {
                    // keep the inserted text, delete around it
                    let head = ins_pos - position;
                    vec![
                        TextOp::delete(*position, head),
                        TextOp::delete(position + inserted, length - head),
                    ]
                }
            }

            (
                TextOp::Delete { position, length },
                TextOp::Delete {
                    position: other_pos,
                    length: other_len,
                },
            ) => {
                let end = position + length;
                let other_end = other_pos + other_len;
                if other_end <= *position {
                    vec![TextOp::delete(position - other_len, *length)]
                } else if *other_pos >= end {
                    vec![self.clone()]
                } else {
                    let overlap = end.min(other_end) - (*position).max(*other_pos);
                    let start = (*position).min(*other_pos);
                    vec![TextOp::delete(start, length - overlap)]
                }
            }
        };

        transformed.into_iter().filter(|op| !op.is_noop()).collect()
    }

    /// Where a cursor at `offset` ends up once this op has been applied
    pub fn transform_offset(&self, offset: usize) -> usize {
        match self {
            TextOp::Insert { position, text } => {
                if *position <= offset {
                    offset + char_len(text)
                } else {
                    offset
                }
            }
            TextOp::Delete { position, length } => {
                if offset <= *position {
                    offset
                } else if offset >= position + length {
                    offset - length
                } else {
                    *position
                }
            }
        }
    }
}

/// Apply a batch atomically
pub fn apply_all(content: &mut String, ops: &[TextOp]) -> Result<()> {
    let mut scratch = content.clone();
    for op in ops {
        op.apply(&mut scratch)?;
    }
    *content = scratch;
    Ok(())
}

/// Transform two concurrent batches against each other.
///
/// Returns `(a', b')` such that applying `a` then `b'` yields the same text as
/// applying `b` then `a'`. Inserts from `a` win ties according to `bias`.
pub fn transform(a: &[TextOp], b: &[TextOp], bias: Bias) -> (Vec<TextOp>, Vec<TextOp>) {
    if a.is_empty() || b.is_empty() {
        return (a.to_vec(), b.to_vec());
    }

    if a.len() == 1 && b.len() == 1 {
        return (a[0].transform(&b[0], bias), b[0].transform(&a[0], bias.flip()));
    }

    if a.len() > 1 {
        let (head, b_after_head) = transform(&a[..1], b, bias);
        let (rest, b_after_all) = transform(&a[1..], &b_after_head, bias);
        let mut a_prime = head;
        a_prime.extend(rest);
        return (a_prime, b_after_all);
    }

    let (a_after_head, head) = transform(a, &b[..1], bias);
    let (a_after_all, rest) = transform(&a_after_head, &b[1..], bias);
    let mut b_prime = head;
    b_prime.extend(rest);
    (a_after_all, b_prime)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn byte_offset(content: &str, char_index: usize) -> usize {
    content
        .char_indices()
        .nth(char_index)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len())
}
