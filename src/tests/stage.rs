use super::common;
use crate::{Error, Stage, StageKind, Status, plumb};

#[test]
fn command_line_splits_into_program_and_args() {
    common::init();
    let stage = plumb("cat -e").unwrap();
    assert_eq!(stage.kind(), StageKind::Program);
    assert!(stage.ready());
    assert_eq!(stage.name(), "`cat -e`");
}

#[test]
fn command_line_unquotes() {
    common::init();
    let stage = plumb("sed 's/hi there/bye/'").unwrap();
    assert_eq!(stage.name(), "`sed 's/hi there/bye/'`");
}

#[test]
fn malformed_command_line_is_a_parse_error() {
    common::init();
    assert!(matches!(plumb("sed 's/unterminated"), Err(Error::Parse { .. })));
}

#[test]
fn empty_command_line_is_not_ready() {
    common::init();
    let stage = plumb("").unwrap();
    assert_eq!(stage.status(), Status::Error);
    stage.set_program("true");
    assert_eq!(stage.status(), Status::Ready);
}

#[test]
fn program_name_taken_verbatim() {
    common::init();
    let stage = Stage::program("some program");
    assert!(stage.ready());
    assert_eq!(stage.name(), "`'some program'`");
}

#[test]
fn fitting_kinds() {
    common::init();
    assert_eq!(Stage::plug().kind(), StageKind::Plug);
    assert_eq!(Stage::vent().kind(), StageKind::Vent);
    assert_eq!(Stage::bucket().kind(), StageKind::Bucket);
    assert_eq!(Stage::hose().kind(), StageKind::Hose);
    assert_eq!(Stage::prng().kind(), StageKind::Prng);
}

#[test]
fn linking_installs_back_reference() {
    common::init();
    let a = plumb("true").unwrap();
    let b = plumb("true").unwrap();
    let a = a.output(&b).unwrap();
    assert_eq!(b.input_peer().unwrap(), a);
    assert_eq!(a.output_peer().unwrap(), b);
}

#[test]
fn back_reference_does_not_keep_peer_alive() {
    common::init();
    let b = plumb("true").unwrap();
    {
        let a = plumb("true").unwrap();
        let _a = a.output(&b).unwrap();
        assert!(b.input_peer().is_some());
    }
    // a is gone; the back-reference must not have kept it alive
    assert!(b.input_peer().is_none());
}

#[test]
fn forward_edge_keeps_peer_alive() {
    common::init();
    let a = plumb("true").unwrap();
    let b = plumb("true").unwrap();
    let a = a.output(b).unwrap();
    // the Stage passed by value is owned by the edge now
    assert!(a.output_peer().is_some());
}

#[test]
fn linking_to_self_is_rejected() {
    common::init();
    let a = plumb("cat").unwrap();
    let clone = a.clone();
    assert!(matches!(a.output(&clone), Err(Error::Config(_))));
}

#[test]
fn relinking_a_bound_slot_is_rejected() {
    common::init();
    let a = plumb("cat").unwrap().output(plumb("cat").unwrap()).unwrap();
    assert!(matches!(
        a.output(plumb("cat").unwrap()),
        Err(Error::Config(_))
    ));
}

#[test]
fn fitting_orientation_is_exclusive() {
    common::init();
    // a bucket that already collects cannot also pour
    let bucket = Stage::bucket();
    let _consumer = plumb("cat").unwrap().output(&bucket).unwrap();
    assert!(matches!(
        plumb("cat").unwrap().input(&bucket),
        Err(Error::Config(_))
    ));
}

#[test]
fn one_bucket_cannot_catch_both_output_and_stderr() {
    common::init();
    let bucket = Stage::bucket();
    let stage = plumb("cat").unwrap().output(&bucket).unwrap();
    assert!(matches!(stage.stderr(&bucket), Err(Error::Config(_))));
}

#[test]
fn fittings_have_no_stderr() {
    common::init();
    assert!(matches!(
        Stage::plug().stderr("/dev/null"),
        Err(Error::Config(_))
    ));
}

#[test]
fn empty_pouring_bucket_is_an_error_until_filled() {
    common::init();
    let bucket = Stage::bucket();
    let _consumer = plumb("cat").unwrap().input(&bucket).unwrap();
    assert_eq!(bucket.status(), Status::Error);
    bucket.set_contents("now it has something").unwrap();
    assert_eq!(bucket.status(), Status::Ready);
}

#[test]
fn terminus_walks_the_output_chain() {
    common::init();
    let a = plumb("cat").unwrap();
    let b = plumb("cat").unwrap();
    let a = a.output(&b).unwrap();
    let terminus = a.terminus();
    // b's unset output grew a default bucket, which ends the chain
    assert_eq!(terminus.kind(), StageKind::Bucket);
    assert_eq!(b.output_peer().unwrap(), terminus);
    assert_eq!(terminus.terminus(), terminus);
}

#[test]
fn wrong_kind_operations_are_config_errors() {
    common::init();
    let cat = plumb("cat").unwrap();
    assert!(matches!(cat.collect_max(10), Err(Error::Config(_))));
    assert!(matches!(cat.contents(), Err(Error::Config(_))));
    assert!(matches!(cat.getline(), Err(Error::Config(_))));
    assert!(matches!(cat.print("x"), Err(Error::Config(_))));
    assert!(matches!(cat.close(), Err(Error::Config(_))));
    assert!(matches!(cat.encrypt_with("gpg"), Err(Error::Config(_))));
}

#[test]
fn errormsg_is_empty_before_running() {
    common::init();
    let stage = plumb("true").unwrap();
    assert_eq!(stage.errormsg(), "");
    assert_eq!(stage.rc(), None);
    assert_eq!(stage.pid(), None);
}

#[test]
fn stage_display_uses_name() {
    common::init();
    let stage = plumb("echo 'hi there'").unwrap();
    assert_eq!(format!("{}", stage), "`echo 'hi there'`");
}
