//! Integration tests for the scripted first-boot password change

mod common;

use common::{FakeOpener, PASSWD_PROMPTS};
use nodeprov::core::interactive::{first_boot_script, run_script, InteractionStep, PasswordChangeOptions, PasswordChanger};
use nodeprov::error::InteractError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const NEW_PASSWORD: &str = "s3cret-Pass";

fn options(attempts: u32) -> PasswordChangeOptions {
    PasswordChangeOptions {
        current: "ubuntu".to_string(),
        attempts,
        retry_delay: Duration::from_millis(10),
        step_timeout: Duration::from_secs(5),
        final_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_password_change_answers_prompts_in_order() {
    let opener = Arc::new(FakeOpener::passwd("passwd: password updated successfully\r\n"));
    let changer = PasswordChanger::new(opener.clone(), NEW_PASSWORD, options(3));

    assert_eq!(changer.change().await.unwrap(), 1);
    assert_eq!(opener.received(), vec!["ubuntu", NEW_PASSWORD, NEW_PASSWORD]);
}

#[tokio::test]
async fn test_refused_connections_are_retried() {
    let opener = Arc::new(FakeOpener::passwd("passwd: password updated successfully\n").refusing(2));
    let changer = PasswordChanger::new(opener.clone(), NEW_PASSWORD, options(3));

    assert_eq!(changer.change().await.unwrap(), 3);
    assert_eq!(opener.opened(), 1);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let opener = Arc::new(FakeOpener::passwd("passwd: password updated successfully\n").refusing(10));
    let err = PasswordChanger::new(opener.clone(), NEW_PASSWORD, options(2))
        .change()
        .await
        .unwrap_err();
    match err {
        InteractError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(last.contains("Connection refused"));
        }
        other => panic!("expected AttemptsExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_policy_rejection_is_not_retried() {
    let opener = Arc::new(FakeOpener::passwd(
        "BAD PASSWORD: The password is shorter than 8 characters\npasswd: Authentication token manipulation error\n",
    ));
    let err = PasswordChanger::new(opener.clone(), "short", options(3))
        .change()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        InteractError::Rejected {
            reason: "password too short".to_string()
        }
    );
    assert_eq!(opener.opened(), 1);
}

#[tokio::test]
async fn test_unexplained_hangup_is_a_failure() {
    let opener = Arc::new(FakeOpener::passwd("Connection to 192.168.1.101 closed.\r\n"));
    let err = PasswordChanger::new(opener.clone(), NEW_PASSWORD, options(3))
        .change()
        .await
        .unwrap_err();
    match err {
        InteractError::Unrecognized { tail } => assert!(tail.contains("closed")),
        other => panic!("expected Unrecognized, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mid_script_timeout_is_reported_not_replayed() {
    let opener = Arc::new(FakeOpener::new(
        ["Current password: ", "passwd: Authentication token manipulation error\n"],
        "",
    ));
    let options = PasswordChangeOptions {
        step_timeout: Duration::from_millis(200),
        ..options(3)
    };
    let err = PasswordChanger::new(opener.clone(), NEW_PASSWORD, options)
        .change()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InteractError::Timeout { step: 2, ref expected, .. } if expected == "New password:"
    ));
    assert_eq!(opener.opened(), 1);
    assert_eq!(opener.received(), vec!["ubuntu"]);
}

#[tokio::test]
async fn test_console_login_variant() {
    let mut prompts = vec!["\r\nhost1 login: ", "Password: "];
    prompts.extend(PASSWD_PROMPTS);
    let opener = Arc::new(FakeOpener::new(prompts, "passwd: all authentication tokens updated successfully.\n"));
    let script = first_boot_script(Some("ubuntu"), "ubuntu", NEW_PASSWORD, Duration::from_secs(5));
    let changer = PasswordChanger::new(opener.clone(), NEW_PASSWORD, options(1)).with_script(script);

    assert_eq!(changer.change().await.unwrap(), 1);
    assert_eq!(
        opener.received(),
        vec!["ubuntu", "ubuntu", "ubuntu", NEW_PASSWORD, NEW_PASSWORD]
    );
}

#[tokio::test]
async fn test_unexpected_prompt_stops_the_script() {
    let (client, mut server) = tokio::io::duplex(1024);
    let peer = tokio::spawn(async move {
        server.write_all(b"New password: ").await.unwrap();
        let mut received = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(500), server.read_to_end(&mut received)).await;
        received
    });

    let steps = vec![
        InteractionStep::line("Current password:", "ubuntu", Duration::from_millis(100)),
        InteractionStep::line("New password:", NEW_PASSWORD, Duration::from_millis(100)),
    ];
    let err = run_script(client, &steps, Duration::from_millis(100), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InteractError::Timeout { step: 1, ref expected, .. } if expected == "Current password:"
    ));
    assert!(peer.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_closed_before_match() {
    let (client, mut server) = tokio::io::duplex(1024);
    tokio::spawn(async move {
        server.write_all(b"ssh: connect to host 192.168.1.101 port 22: Connection refused\r\n").await.unwrap();
    });

    let steps = first_boot_script(None, "ubuntu", NEW_PASSWORD, Duration::from_secs(5));
    let err = run_script(client, &steps, Duration::from_secs(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        InteractError::ClosedBeforeMatch {
            step: 1,
            expected: "Current password:".to_string()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_cancel_interrupts_wait() {
    let (client, _server) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let steps = first_boot_script(None, "ubuntu", NEW_PASSWORD, Duration::from_secs(30));
    let err = run_script(client, &steps, Duration::from_secs(1), cancel).await.unwrap_err();
    assert_eq!(err, InteractError::Cancelled);
}
