use super::*;

#[test]
fn configuration_errors_are_fatal() {
    let err = VaultsmithError::configuration("topology", "duplicate node id");
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("topology"));
}

#[test]
fn inconsistent_state_is_fatal() {
    let err = VaultsmithError::inconsistent_state("unseal keys present for uninitialised cluster");
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[test]
fn transient_conditions_are_retryable() {
    assert!(VaultsmithError::NoReadyNode.is_retryable());
    assert!(VaultsmithError::raft_not_converged("missing vault_1-node_b").is_retryable());
    assert!(VaultsmithError::QuorumLost {
        node_id: "vault_1-node_a".into(),
        message: "no leader".into(),
    }
    .is_retryable());
}

#[test]
fn unexpected_errors_default_to_retryable() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
    let err: VaultsmithError = io.into();
    assert!(err.is_retryable());

    let api = VaultsmithError::VaultApi {
        endpoint: "https://10.0.0.1:8200/v1/sys/health".into(),
        status: 500,
        errors: vec!["boom".into(), "bang".into()],
    };
    assert!(api.is_retryable());
    assert_eq!(api.vault_status(), Some(500));
    assert!(api.to_string().contains("boom; bang"));
}

#[test]
fn safe_exit_and_exhaustion() {
    assert_eq!(
        VaultsmithError::safe_exit("operator declined").kind(),
        ErrorKind::SafeExit
    );
    let exhausted = VaultsmithError::RetriesExhausted {
        attempts: 5,
        last: Box::new(VaultsmithError::NoReadyNode),
    };
    assert_eq!(exhausted.kind(), ErrorKind::Fatal);
    assert!(exhausted.to_string().contains("No ready node found"));
}

#[tokio::test]
async fn join_error_conversion() {
    async fn panics() {
        panic!("test panic");
    }

    let result: Result<()> = async {
        tokio::spawn(panics()).await?;
        Ok(())
    }
    .await;

    match result {
        Err(VaultsmithError::Internal { message }) => assert!(message.contains("Task panicked")),
        other => panic!("expected internal error, got {:?}", other),
    }
}

#[test]
fn operator_input_failures_are_fatal() {
    assert_eq!(VaultsmithError::Interrupted.kind(), ErrorKind::Fatal);
    let err = VaultsmithError::operator_input("not a terminal");
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("not a terminal"));
}
