//! Client-side staging bookkeeping: which local files have been shipped to
//! the sandbox, and rewriting references inside the primary input file so
//! the controller finds its siblings under their server-assigned names.

use std::collections::{HashMap, HashSet};

use discon_proto::staging::basename;
use discon_proto::STAGED_PREFIX;

/// Substitutes each staged sibling's basename with its server-assigned
/// basename inside `content`. The primary input file itself is skipped (its
/// own name is rewritten through the frame, not its content), and names that
/// already carry the staged prefix are never rewritten.
pub fn rewrite_references(
    content: &[u8],
    staged: &HashMap<String, String>,
    primary: &HashSet<String>,
) -> Vec<u8> {
    let mut out = content.to_vec();
    for (local, server) in staged {
        if primary.contains(local) {
            continue;
        }
        let local_base = basename(local);
        if local_base.starts_with(STAGED_PREFIX) {
            continue;
        }
        out = replace_whole_word(&out, local_base.as_bytes(), basename(server).as_bytes());
    }
    out
}

// Filename tokens: a maximal run of these bytes. Substitution only applies
// when the match is not embedded in a longer token.
fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')
}

fn replace_whole_word(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            let before_ok = i == 0 || !is_word_byte(haystack[i - 1]);
            let end = i + needle.len();
            let after_ok = end >= haystack.len() || !is_word_byte(haystack[end]);
            if before_ok && after_ok {
                out.extend_from_slice(replacement);
                i = end;
                continue;
            }
        }
        out.push(haystack[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn rewrites_whole_words_only() {
        let map = staged(&[("conf/servo.cfg", "input_12345678_servo.cfg")]);
        let content = b"use servo.cfg here\nnot my_servo.cfg\nservo.cfg.bak stays\n";
        let out = rewrite_references(content, &map, &HashSet::new());
        assert_eq!(
            out,
            b"use input_12345678_servo.cfg here\nnot my_servo.cfg\nservo.cfg.bak stays\n".to_vec()
        );
    }

    #[test]
    fn skips_primary_and_already_staged_names() {
        let mut map = staged(&[
            ("main.in", "input_aaaaaaaa_main.in"),
            ("input_bbbbbbbb_x.dat", "input_cccccccc_x.dat"),
        ]);
        map.insert("aero.dat".to_string(), "input_dddddddd_aero.dat".to_string());
        let primary: HashSet<String> = ["main.in".to_string()].into();

        let content = b"main.in input_bbbbbbbb_x.dat aero.dat";
        let out = rewrite_references(content, &map, &primary);
        assert_eq!(
            out,
            b"main.in input_bbbbbbbb_x.dat input_dddddddd_aero.dat".to_vec()
        );
    }

    #[test]
    fn replacement_at_boundaries() {
        assert_eq!(replace_whole_word(b"a.txt", b"a.txt", b"B"), b"B".to_vec());
        assert_eq!(
            replace_whole_word(b"(a.txt)", b"a.txt", b"B"),
            b"(B)".to_vec()
        );
        assert_eq!(
            replace_whole_word(b"xa.txt", b"a.txt", b"B"),
            b"xa.txt".to_vec()
        );
    }
}
