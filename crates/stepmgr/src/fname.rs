//! Stdio file name patterns.
//!
//! File-backed task stdio accepts `%j` (job id), `%s` (step id), `%t`
//! (global task id), and `%%` for a literal percent.

pub fn expand(pattern: &str, job_id: u32, step_id: u32, gtid: u32) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('j') => out.push_str(&job_id.to_string()),
            Some('s') => out.push_str(&step_id.to_string()),
            Some('t') => out.push_str(&gtid.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_all_fields() {
        assert_eq!(expand("out.%j.%s.%t", 12, 3, 7), "out.12.3.7");
    }

    #[test]
    fn literal_percent_and_unknown_escape() {
        assert_eq!(expand("100%%|%q", 1, 1, 1), "100%|%q");
    }

    #[test]
    fn plain_names_untouched() {
        assert_eq!(expand("/tmp/step.log", 1, 2, 3), "/tmp/step.log");
    }
}
