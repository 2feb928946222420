//! Table-driven checks that the escaper never lets an interpolated value
//! break out of its shell token, across a spread of adversarial payloads.

use anyhost::{escape::escape_one, HostFamily};

const ADVERSARIAL_POSIX_PAYLOADS: &[&str] = &[
    "'; rm -rf /",
    "$(id)",
    "`id`",
    "a; b",
    "a && b",
    "a || b",
    "a | b",
    "a\nb",
    "a\tb",
    "$HOME",
    "${HOME}",
    "~root",
    "*.rs",
    "--flag=value",
    "",
];

#[test]
fn posix_payloads_round_trip_through_a_real_shell() {
    for payload in ADVERSARIAL_POSIX_PAYLOADS {
        let escaped = escape_one(payload, HostFamily::Posix);
        let line = format!("printf '%s' {escaped}");
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(&line)
            .output()
            .expect("sh must be on PATH");
        assert!(output.status.success(), "sh rejected: {line}");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            *payload,
            "payload {payload:?} did not round-trip through the shell"
        );
    }
}

#[test]
fn windows_cmd_payloads_stay_inside_one_double_quoted_token() {
    for payload in ["a & b", "a | b", "a\"b", "a^b", "%PATH%"] {
        let escaped = escape_one(payload, HostFamily::WindowsCmd);
        assert!(escaped.starts_with('"') && escaped.ends_with('"'), "{escaped}");
    }
}

#[tokio::test]
async fn sh_macro_assembles_and_runs_a_multi_value_template() {
    use anyhost::{sh, Engine};
    let engine = Engine::default();
    let outcome = sh!(engine, "echo {} {}", "first arg", "second; rm -rf /").await.unwrap();
    assert_eq!(outcome.text(), "first arg second; rm -rf /");
}

#[tokio::test]
async fn raw_macro_allows_intentional_shell_syntax() {
    use anyhost::{raw, Engine};
    let engine = Engine::default();
    let outcome = raw!(engine, "echo a {} echo b", "&&").await.unwrap();
    assert_eq!(outcome.text(), "a\nb");
}
