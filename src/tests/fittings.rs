use super::common;
use crate::{Error, Stage, plumb};

#[test]
fn plug_feeds_end_of_file() {
    common::init();
    let cat = plumb("cat")
        .unwrap()
        .input(Stage::plug())
        .unwrap()
        .output(Stage::bucket())
        .unwrap();
    cat.execute().unwrap();
    let terminus = cat.terminus();
    assert_eq!(terminus.contents().unwrap(), b"");
    assert!(cat.ok().unwrap());
}

#[test]
fn plug_rejects_writes() {
    common::init();
    let dd = plumb("dd if=/dev/zero bs=1k count=200")
        .unwrap()
        .output(Stage::plug())
        .unwrap()
        .stderr("/dev/null")
        .unwrap();
    dd.execute().unwrap();
    let rc = dd.wait().unwrap().unwrap();
    assert!(!rc.success());
    assert!(!dd.errormsg().is_empty());
    assert!(!dd.ok().unwrap());
}

#[test]
fn vent_discards_writes() {
    common::init();
    let echo = plumb("echo unheard")
        .unwrap()
        .output(Stage::vent())
        .unwrap();
    assert!(echo.ok().unwrap());
}

#[test]
fn vent_truncated_by_collect_max() {
    common::init();
    let cat = plumb("cat").unwrap().input(Stage::vent()).unwrap();
    let terminus = cat.terminus().collect_max(1000).unwrap();
    cat.execute().unwrap();
    let contents = terminus.contents().unwrap();
    assert_eq!(contents.len(), 1000);
    assert!(contents.iter().all(|&b| b == 0));
    assert!(terminus.truncated());

    let expected = "bucket(filling): not spooling more than 1000 bytes from `cat`";
    let emitted = common::warnings_containing(expected);
    assert_eq!(emitted.len(), 1, "warning must be emitted exactly once");
    assert_eq!(emitted[0], expected);

    // the producer was cut off by the closed pipe, not left running
    assert!(!cat.running());
    // a second look hands out the same bytes without spooling again
    assert_eq!(terminus.contents().unwrap().len(), 1000);
    assert_eq!(common::warnings_containing(expected).len(), 1);
}

#[test]
fn pouring_bucket_feeds_its_contents() {
    common::init();
    let sed = plumb("sed s/$/bar/")
        .unwrap()
        .input(Stage::bucket_from("foo\n"))
        .unwrap();
    let out = sed.terminus().contents_str().unwrap();
    assert!(out.contains("foobar"), "got {:?}", out);
}

#[test]
fn filling_bucket_reads_code_output_line_by_line() {
    common::init();
    let code = Stage::code(|stage| {
        // write to the real fd 1; print! would be swallowed by the test
        // harness capture the child inherits
        use std::io::Write as _;
        write!(std::io::stdout(), "O HAI\n{}\n", stage.pid().unwrap()).unwrap();
    });
    let bucket = Stage::bucket().input(&code).unwrap();
    assert_eq!(bucket.getline().unwrap().unwrap(), "O HAI\n");
    let pid_line = bucket.getline().unwrap().unwrap();
    assert_eq!(pid_line.trim_end().parse::<u32>().unwrap(), code.pid().unwrap());
    assert_eq!(bucket.getline().unwrap(), None);
}

#[test]
fn gushing_hose_feeds_the_peer() {
    common::init();
    let hose = Stage::hose();
    let cat = plumb("cat")
        .unwrap()
        .input(&hose)
        .unwrap()
        .output(Stage::bucket())
        .unwrap();
    cat.execute().unwrap();
    assert!(hose.handle_fd().is_some());
    hose.print("Hello, world\n").unwrap();
    hose.close().unwrap();
    assert_eq!(
        cat.terminus().getline().unwrap().as_deref(),
        Some("Hello, world\n")
    );
}

#[test]
fn sucking_hose_reads_from_the_peer() {
    common::init();
    let hose = Stage::hose();
    let printf = plumb("printf 'one\\ntwo\\n'")
        .unwrap()
        .output(&hose)
        .unwrap();
    printf.execute().unwrap();
    assert_eq!(hose.getline().unwrap().as_deref(), Some("one\n"));
    assert_eq!(hose.getline().unwrap().as_deref(), Some("two\n"));
    assert_eq!(hose.getline().unwrap(), None);
    assert!(printf.ok().unwrap());
}

#[test]
fn hose_sides_are_directional() {
    common::init();
    let hose = Stage::hose();
    let cat = plumb("cat").unwrap().input(&hose).unwrap();
    // not connected until the pipeline runs
    assert!(matches!(hose.print("early\n"), Err(Error::Config(_))));
    assert!(hose.handle_fd().is_none());
    cat.execute().unwrap();
    // the user side of a gushing hose writes; reading it is an error
    assert!(matches!(hose.getline(), Err(Error::Config(_))));
    hose.close().unwrap();
    assert!(cat.ok().unwrap());
}

#[test]
fn prng_sources_entropy() {
    common::init();
    let head = plumb("head -c 16").unwrap().input(Stage::prng()).unwrap();
    let bytes = head.terminus().contents().unwrap();
    assert_eq!(bytes.len(), 16);
}

#[test]
fn prng_sink_delegates_to_the_configured_command() {
    common::init();
    // stand in for gpg with something universally installed
    let prng = Stage::prng().encrypt_with("wc -c").unwrap();
    let echo = plumb("printf 12345").unwrap().output(&prng).unwrap();
    let out = prng.terminus().contents_str().unwrap();
    assert_eq!(out.trim(), "5");
    assert!(echo.ok().unwrap());
}

#[test]
fn bucket_contents_without_plumbing() {
    common::init();
    let bucket = Stage::bucket_from("already here");
    assert_eq!(bucket.contents().unwrap(), b"already here");
}

#[test]
fn filling_bucket_cannot_be_prefilled() {
    common::init();
    let bucket = Stage::bucket();
    let _cat = plumb("cat").unwrap().output(&bucket).unwrap();
    assert!(matches!(bucket.set_contents("nope"), Err(Error::Config(_))));
}
