//! RFC 1459 casemapping.
//!
//! Nicknames compare case-insensitively with `[]\~` folding onto `{}|^`
//! (CASEMAPPING=rfc1459). Every server in the mesh must fold identically or
//! two servers can disagree on whether a nick is taken.

/// Fold a single byte per RFC 1459.
fn fold(b: u8) -> u8 {
    match b {
        b'A'..=b'Z' => b + 32,
        b'[' => b'{',
        b']' => b'}',
        b'\\' => b'|',
        b'~' => b'^',
        other => other,
    }
}

/// Normalize a string for case-insensitive IRC comparison.
pub fn irc_lower(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() { fold(c as u8) as char } else { c })
        .collect()
}

/// Case-insensitive equality under RFC 1459 folding.
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).all(|(x, y)| fold(x) == fold(y))
}

/// Glob match (`*` and `?`) under RFC 1459 folding. Used for reserved nicks.
pub fn irc_glob(pattern: &str, name: &str) -> bool {
    let p: Vec<u8> = pattern.bytes().map(fold).collect();
    let n: Vec<u8> = name.bytes().map(fold).collect();

    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            mark = ni;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_folds_ascii_letters() {
        assert_eq!(irc_lower("Alice"), "alice");
    }

    #[test]
    fn lower_folds_rfc1459_specials() {
        assert_eq!(irc_lower("[Nick]\\~"), "{nick}|^");
    }

    #[test]
    fn eq_ignores_case_and_specials() {
        assert!(irc_eq("Carol", "carol"));
        assert!(irc_eq("foo[bar]", "FOO{BAR}"));
        assert!(!irc_eq("carol", "carol_"));
    }

    #[test]
    fn glob_exact_and_wildcards() {
        assert!(irc_glob("ChanServ", "chanserv"));
        assert!(irc_glob("*Serv", "NickServ"));
        assert!(irc_glob("oper?", "Oper1"));
        assert!(irc_glob("a*b*c", "axxbyyc"));
        assert!(!irc_glob("a*b", "acd"));
        assert!(!irc_glob("admin", "admin2"));
    }
}
