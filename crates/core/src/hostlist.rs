//! Compressed host list syntax.
//!
//! Partition membership and forwarding targets travel as either an explicit
//! name list or a compressed range pattern such as `node[0-3,7],login0`.
//! The bitmap over the node table stays the canonical form; these functions
//! only serialize and parse the human-readable shape.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostlistError {
    #[error("unbalanced brackets in host pattern {0:?}")]
    UnbalancedBrackets(String),
    #[error("bad range {0:?} in host pattern")]
    BadRange(String),
}

/// Expand a pattern into individual host names, preserving order.
///
/// `n[0-2]` yields `n0 n1 n2`; zero-padded bounds keep their width, so
/// `n[08-10]` yields `n08 n09 n10`. Names without brackets pass through.
pub fn expand(pattern: &str) -> Result<Vec<String>, HostlistError> {
    let mut out = Vec::new();
    for part in split_top_level(pattern)? {
        if part.is_empty() {
            continue;
        }
        match part.find('[') {
            None => out.push(part.to_string()),
            Some(open) => {
                let close = part
                    .rfind(']')
                    .ok_or_else(|| HostlistError::UnbalancedBrackets(pattern.to_string()))?;
                if close < open {
                    return Err(HostlistError::UnbalancedBrackets(pattern.to_string()));
                }
                let prefix = &part[..open];
                let suffix = &part[close + 1..];
                for piece in part[open + 1..close].split(',') {
                    expand_piece(prefix, piece, suffix, &mut out)?;
                }
            }
        }
    }
    Ok(out)
}

fn expand_piece(
    prefix: &str,
    piece: &str,
    suffix: &str,
    out: &mut Vec<String>,
) -> Result<(), HostlistError> {
    let (lo, hi) = match piece.split_once('-') {
        None => (piece, piece),
        Some(pair) => pair,
    };
    let width = lo.len();
    let lo_n: u64 = lo
        .parse()
        .map_err(|_| HostlistError::BadRange(piece.to_string()))?;
    let hi_n: u64 = hi
        .parse()
        .map_err(|_| HostlistError::BadRange(piece.to_string()))?;
    if hi_n < lo_n {
        return Err(HostlistError::BadRange(piece.to_string()));
    }
    for n in lo_n..=hi_n {
        out.push(format!("{prefix}{n:0width$}{suffix}"));
    }
    Ok(())
}

/// Split on commas that are not inside brackets.
fn split_top_level(pattern: &str) -> Result<Vec<&str>, HostlistError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in pattern.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostlistError::UnbalancedBrackets(pattern.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&pattern[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(HostlistError::UnbalancedBrackets(pattern.to_string()));
    }
    parts.push(&pattern[start..]);
    Ok(parts)
}

/// Compress a name list back into range syntax. Consecutive numeric suffixes
/// with a common prefix and digit width collapse into one bracket group.
pub fn compress(hosts: &[String]) -> String {
    #[derive(Debug)]
    struct Run {
        prefix: String,
        width: usize,
        first: u64,
        last: u64,
    }

    fn flush(run: Option<Run>, groups: &mut Vec<String>) {
        let Some(run) = run else { return };
        let Run {
            prefix,
            width,
            first,
            last,
        } = run;
        if first == last {
            groups.push(format!("{prefix}{first:0width$}"));
        } else {
            groups.push(format!("{prefix}[{first:0width$}-{last:0width$}]"));
        }
    }

    let mut groups: Vec<String> = Vec::new();
    let mut run: Option<Run> = None;

    for host in hosts {
        let split = host.len() - host.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        let (prefix, digits) = host.split_at(split);
        let parsed = digits.parse::<u64>().ok();

        match (&mut run, parsed) {
            (Some(r), Some(n))
                if r.prefix == prefix && r.width == digits.len() && n == r.last + 1 =>
            {
                r.last = n;
            }
            (_, Some(n)) => {
                flush(run.take(), &mut groups);
                run = Some(Run {
                    prefix: prefix.to_string(),
                    width: digits.len(),
                    first: n,
                    last: n,
                });
            }
            (_, None) => {
                flush(run.take(), &mut groups);
                groups.push(host.clone());
            }
        }
    }
    flush(run, &mut groups);
    groups.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(
            expand("alpha,beta").unwrap(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn ranges_expand_in_order() {
        assert_eq!(
            expand("n[0-2,5]").unwrap(),
            vec!["n0", "n1", "n2", "n5"]
        );
    }

    #[test]
    fn zero_padding_is_preserved() {
        assert_eq!(expand("n[08-10]").unwrap(), vec!["n08", "n09", "n10"]);
    }

    #[test]
    fn mixed_pattern() {
        assert_eq!(
            expand("login0,n[1-2]").unwrap(),
            vec!["login0", "n1", "n2"]
        );
    }

    #[test]
    fn bad_patterns_error() {
        assert!(matches!(
            expand("n[0-2"),
            Err(HostlistError::UnbalancedBrackets(_))
        ));
        assert!(matches!(expand("n[2-0]"), Err(HostlistError::BadRange(_))));
        assert!(matches!(expand("n[a-b]"), Err(HostlistError::BadRange(_))));
    }

    #[test]
    fn compress_round_trip() {
        let hosts: Vec<String> = expand("n[0-3],n7,login0").unwrap();
        let pattern = compress(&hosts);
        assert_eq!(pattern, "n[0-3],n7,login0");
        assert_eq!(expand(&pattern).unwrap(), hosts);
    }

    #[test]
    fn compress_breaks_on_gap_and_prefix() {
        let hosts = vec![
            "a1".to_string(),
            "a2".to_string(),
            "a4".to_string(),
            "b5".to_string(),
        ];
        assert_eq!(compress(&hosts), "a[1-2],a4,b5");
    }
}
