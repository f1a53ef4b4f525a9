use io_plumbing::{Stage, quote, unquote};

// Arguments built with arg() must reach the child byte for byte, with no
// intervening shell to mangle them, and the word codec must round-trip
// the same material.
#[test]
fn arguments_survive_the_trip() {
    let args = [
        "x", "", " ", "  ", r" \ ", r" \\ ", r#"""#, r#""""#, r#"\"\\""#, "æ÷", "šđ", "本", "❤",
        "☃", "hi'there", "foo>bar", "$HOME", "a\tb",
    ];
    for &arg in &args {
        let printf = Stage::program("printf").arg("%s").arg(arg);
        let out = printf.terminus().contents_str().unwrap();
        assert_eq!(out, arg);
    }

    let words: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let quoted = quote(&words).unwrap();
    assert_eq!(unquote(&quoted).unwrap(), words);
}

#[test]
fn quoting_matches_the_shell() {
    // what quote() produces must mean the same thing to a real shell
    let words = ["printf", "%s@", "a b", "don't", "foo>bar", "wow!"];
    let cmdline = quote(&words).unwrap();
    let sh = Stage::program("sh").arg("-c").arg(&cmdline);
    assert_eq!(
        sh.terminus().contents_str().unwrap(),
        "a b@don't@foo>bar@wow!@"
    );
}
