#[derive(Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Code,
    Literal,
    Comment,
}

/// Walks `sql` and classifies every char as live code, part of a quoted literal, or comment.
fn scan<F: FnMut(usize, char, Kind)>(sql: &str, mut f: F) {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut region = Region::Code;
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, n)| *n);
        match region {
            Region::Code => match c {
                '\'' | '"' | '`' => {
                    region = Region::Quoted(c);
                    f(pos, c, Kind::Literal);
                }
                '-' if next == Some('-') => {
                    region = Region::LineComment;
                    f(pos, c, Kind::Comment);
                }
                '/' if next == Some('*') => {
                    region = Region::BlockComment;
                    f(pos, c, Kind::Comment);
                    i += 1;
                    f(chars[i].0, chars[i].1, Kind::Comment);
                }
                _ => f(pos, c, Kind::Code),
            },
            Region::Quoted(q) => {
                f(pos, c, Kind::Literal);
                if c == q {
                    region = Region::Code;
                }
            }
            Region::LineComment => {
                f(pos, c, Kind::Comment);
                if c == '\n' {
                    region = Region::Code;
                }
            }
            Region::BlockComment => {
                f(pos, c, Kind::Comment);
                if c == '*' && next == Some('/') {
                    i += 1;
                    f(chars[i].0, chars[i].1, Kind::Comment);
                    region = Region::Code;
                }
            }
        }
        i += 1;
    }
}

/// Splits a script on `;` outside quotes and comments. Blank and comment-only
/// statements are dropped; the rest are trimmed.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut boundaries = Vec::new();
    scan(script, |pos, c, kind| {
        if kind == Kind::Code && c == ';' {
            boundaries.push(pos);
        }
    });
    for end in boundaries {
        statements.push(&script[start..end]);
        start = end + 1;
    }
    statements.push(&script[start..]);

    statements
        .into_iter()
        .filter(|s| has_code(s))
        .map(|s| s.trim().to_string())
        .collect()
}

fn has_code(sql: &str) -> bool {
    let mut found = false;
    scan(sql, |_, c, kind| match kind {
        Kind::Code if !c.is_whitespace() => found = true,
        Kind::Literal => found = true,
        _ => {}
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons() {
        let got = split_statements("UPDATE t SET x=? WHERE id=?; DELETE FROM u WHERE id=?");
        assert_eq!(
            got,
            vec!["UPDATE t SET x=? WHERE id=?", "DELETE FROM u WHERE id=?"]
        );
    }

    #[test]
    fn ignores_semicolons_in_quotes_and_comments() {
        let script = "INSERT INTO t VALUES ('a;b', \"c;d\", `e;f`); -- trailing; comment\nSELECT 1 /* x; y */";
        let got = split_statements(script);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], "INSERT INTO t VALUES ('a;b', \"c;d\", `e;f`)");
        assert!(got[1].ends_with("SELECT 1 /* x; y */"));
    }

    #[test]
    fn drops_blank_and_comment_only_statements() {
        let script = ";;\n  ;-- only a comment\n; /* block */ ; SELECT 1;";
        assert_eq!(split_statements(script), vec!["SELECT 1"]);
        assert!(split_statements("   ").is_empty());
    }

    #[test]
    fn doubled_quotes_stay_inside_literal() {
        let got = split_statements("SELECT 'it''s; fine'; SELECT 2");
        assert_eq!(got, vec!["SELECT 'it''s; fine'", "SELECT 2"]);
    }
}
