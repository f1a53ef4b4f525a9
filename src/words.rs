//! Tokenizing command lines into words and quoting word lists back into
//! shell-safe command lines.
//!
//! [`quote`] renders a word list as a single string that a POSIX shell (or
//! [`unquote`]) splits back into the original words.  It picks a quoting
//! mechanism per word:
//!
//! - If the word contains a single quote, every character outside the safe
//!   set is backslash-escaped.
//! - Otherwise, if the word contains any character that needs quoting, the
//!   whole word is wrapped in single quotes.
//! - Otherwise the word is emitted verbatim.
//!
//! The safe set is `A`-`Z`, `a`-`z`, `0`-`9`, and `_ ! % + , - . / : @ ^`.
//! A `!` never triggers backslash-escaping but does force single quotes, so
//! the result stays inert under csh-style history expansion.
//!
//! [`unquote`] is the inverse: it consumes a command line left to right,
//! recognizing single-quoted literals, double-quoted fragments with
//! backslash escapes, bare fragments, and single-character `\x` escapes.
//! Adjacent fragments concatenate into one word; unquoted whitespace
//! separates words.  No other shell syntax is interpreted: there are no
//! redirections, no variable expansion, and no globbing.
//!
//! For every word list `ws` free of NUL bytes,
//! `unquote(&quote(&ws)?)? == ws`.
//!
//! # Examples
//!
//! ```
//! # use io_plumbing::words::{quote, unquote};
//! assert_eq!(quote(&["echo", "hi there"]).unwrap(), "echo 'hi there'");
//! assert_eq!(
//!     unquote("sed 's/$/bar/'").unwrap(),
//!     vec!["sed".to_string(), "s/$/bar/".to_string()]
//! );
//! ```

use crate::error::{Error, Result};

fn safe_char(c: char) -> bool {
    matches!(c,
        'A'..='Z' | 'a'..='z' | '0'..='9'
        | '_' | '!' | '%' | '+' | ',' | '-' | '.' | '/' | ':' | '@' | '^')
}

fn quote_word(word: &str, out: &mut String) -> Result<()> {
    if word.contains('\0') {
        return Err(Error::config("cannot quote word containing NUL byte"));
    }
    if word.is_empty() {
        out.push_str("''");
    } else if word.contains('\'') {
        for c in word.chars() {
            if !safe_char(c) {
                out.push('\\');
            }
            out.push(c);
        }
    } else if word.chars().any(|c| c == '!' || !safe_char(c)) {
        out.push('\'');
        out.push_str(word);
        out.push('\'');
    } else {
        out.push_str(word);
    }
    Ok(())
}

/// Quotes a list of words into a single shell-safe string.
///
/// Words are joined with single spaces.  Fails with [`Error::Config`] if a
/// word contains a NUL byte, which no argv entry can carry.
pub fn quote<S: AsRef<str>>(words: &[S]) -> Result<String> {
    let mut out = String::new();
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        quote_word(word.as_ref(), &mut out)?;
    }
    Ok(out)
}

/// Splits a command line into words, undoing quoting.
///
/// Fails with [`Error::Parse`] on input that matches none of the
/// tokenizer's alternatives: an unterminated single or double quote, or a
/// backslash at end of input.
pub fn unquote(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut have_fragment = false;
    let mut chars = input.char_indices();

    while let Some((pos, c)) = chars.next() {
        match c {
            '\'' => {
                // single-quoted literal, no interior escapes
                loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, c)) => cur.push(c),
                        None => {
                            return Err(Error::Parse {
                                pos,
                                reason: "unterminated single quote",
                            });
                        }
                    }
                }
                have_fragment = true;
            }
            '"' => {
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((esc_pos, '\\')) => match chars.next() {
                            Some((_, c)) => cur.push(c),
                            None => {
                                return Err(Error::Parse {
                                    pos: esc_pos,
                                    reason: "backslash at end of input",
                                });
                            }
                        },
                        Some((_, c)) => cur.push(c),
                        None => {
                            return Err(Error::Parse {
                                pos,
                                reason: "unterminated double quote",
                            });
                        }
                    }
                }
                have_fragment = true;
            }
            '\\' => match chars.next() {
                Some((_, c)) => {
                    cur.push(c);
                    have_fragment = true;
                }
                None => {
                    return Err(Error::Parse {
                        pos,
                        reason: "backslash at end of input",
                    });
                }
            },
            c if c.is_whitespace() => {
                if have_fragment {
                    words.push(std::mem::take(&mut cur));
                    have_fragment = false;
                }
            }
            c => {
                cur.push(c);
                have_fragment = true;
            }
        }
    }
    if have_fragment {
        words.push(cur);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(words: &[&str]) {
        let quoted = quote(words).unwrap();
        assert_eq!(unquote(&quoted).unwrap(), words, "via {:?}", quoted);
    }

    #[test]
    fn quote_plain() {
        assert_eq!(quote(&["ls", "-l"]).unwrap(), "ls -l");
        assert_eq!(quote(&["a.b/c:d", "x,y"]).unwrap(), "a.b/c:d x,y");
    }

    #[test]
    fn quote_needs_quoting() {
        assert_eq!(quote(&["foo>bar"]).unwrap(), "'foo>bar'");
        assert_eq!(quote(&["hi there"]).unwrap(), "'hi there'");
        assert_eq!(quote(&["$HOME"]).unwrap(), "'$HOME'");
        assert_eq!(quote(&["wow!"]).unwrap(), "'wow!'");
    }

    #[test]
    fn quote_embedded_single_quote() {
        assert_eq!(quote(&["hi'there"]).unwrap(), r"hi\'there");
        assert_eq!(quote(&["it's a test"]).unwrap(), r"it\'s\ a\ test");
    }

    #[test]
    fn quote_empty_word() {
        assert_eq!(quote(&[""]).unwrap(), "''");
        assert_eq!(quote(&["a", "", "b"]).unwrap(), "a '' b");
    }

    #[test]
    fn quote_rejects_nul() {
        assert!(matches!(quote(&["a\0b"]), Err(Error::Config(_))));
    }

    #[test]
    fn unquote_plain() {
        assert_eq!(unquote("cat -e").unwrap(), ["cat", "-e"]);
        assert_eq!(unquote("  spaced   out  ").unwrap(), ["spaced", "out"]);
        assert_eq!(unquote("").unwrap(), Vec::<String>::new());
        assert_eq!(unquote("   ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn unquote_quotes() {
        assert_eq!(unquote("sed 's/$/bar/'").unwrap(), ["sed", "s/$/bar/"]);
        assert_eq!(unquote(r#"echo "a b" c"#).unwrap(), ["echo", "a b", "c"]);
        assert_eq!(unquote(r#""a\"b""#).unwrap(), [r#"a"b"#]);
        assert_eq!(unquote("''").unwrap(), [""]);
    }

    #[test]
    fn unquote_concatenates_fragments() {
        assert_eq!(unquote("a'b'\"c\"d").unwrap(), ["abcd"]);
        assert_eq!(unquote(r"hi\'there").unwrap(), ["hi'there"]);
    }

    #[test]
    fn unquote_escapes() {
        assert_eq!(unquote(r"a\ b").unwrap(), ["a b"]);
        assert_eq!(unquote(r"\\").unwrap(), ["\\"]);
    }

    #[test]
    fn unquote_errors() {
        assert!(matches!(unquote("'open"), Err(Error::Parse { .. })));
        assert!(matches!(unquote("\"open"), Err(Error::Parse { .. })));
        assert!(matches!(unquote("end\\"), Err(Error::Parse { .. })));
        assert!(matches!(unquote("\"end\\"), Err(Error::Parse { .. })));
    }

    #[test]
    fn roundtrips() {
        roundtrip(&["cat", "-e"]);
        roundtrip(&["hi'there"]);
        roundtrip(&["foo>bar"]);
        roundtrip(&[""]);
        roundtrip(&["a b", "c\td", "e\nf"]);
        roundtrip(&["'", "''", "don't panic!"]);
        roundtrip(&["--opt=val", "~tilde", "*glob?", "$var", "`cmd`"]);
        roundtrip(&["æ÷", "šđ", "本", "❤", "☃"]);
        roundtrip(&["dd", "if=/dev/zero", "bs=1k", "count=200"]);
    }
}
