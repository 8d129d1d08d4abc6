use std::process::Command;

#[test]
fn prints_version() {
    let exe = env!("CARGO_BIN_EXE_channel-pager");
    let output = Command::new(exe)
        .arg("--version")
        .output()
        .expect("run channel-pager --version");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "stdout was: {}",
        stdout.trim()
    );
}

#[test]
fn prints_help() {
    let exe = env!("CARGO_BIN_EXE_channel-pager");
    let output = Command::new(exe)
        .arg("--help")
        .output()
        .expect("run channel-pager --help");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    assert!(stdout.contains("Channel Pager"));
    assert!(stdout.contains("--version"));
    assert!(stdout.contains("--config"));
}

#[test]
fn missing_channel_is_a_usage_error() {
    let exe = env!("CARGO_BIN_EXE_channel-pager");
    let output = Command::new(exe).output().expect("run channel-pager");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr).expect("stderr utf8");
    assert!(stderr.contains("missing channel id"));
}
