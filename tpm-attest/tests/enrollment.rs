// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

mod common;

use common::{credential_for, two_key_configuration, FakeBackend};
use tpm2::{TpmtPublic, Unmarshal};
use tpm_attest::anchor::SoftwareAnchor;
use tpm_attest::keys::{root_name, verify_signature};
use tpm_attest::{enroll, enroll_device, AgentConfig, ApiError, Error};
use tpm_types::{Configuration, KeyHierarchyState};

#[test]
fn test_enroll_activates_every_key() {
    let mut anchor = SoftwareAnchor::new();
    let mut backend = FakeBackend::default();
    let configuration = two_key_configuration();

    let enrollment = enroll(&mut anchor, &configuration, &[], &mut backend).unwrap();
    assert!(!enrollment.is_degraded());
    assert_eq!(enrollment.activated, vec!["aik".to_string(), "signer".to_string()]);
    assert_eq!(anchor.loaded_objects(), 0);

    let state = &enrollment.state;
    assert_eq!(state.primary_key, "aik");
    for (name, key) in &state.keys {
        assert_eq!(key.credential, credential_for(name));
        assert_eq!(key.auth.len(), 32);
    }
    assert!(state.software_anchor.is_some());

    let request = &backend.requests[0];
    assert_eq!(request.keys.len(), 2);
    assert_eq!(request.cookie.len(), 32);
    let root_public = TpmtPublic::from_bytes(&request.root_public).unwrap();
    assert_eq!(root_name(&root_public).unwrap().to_bytes(), state.root.name);
    for key in request.keys.values() {
        let public = TpmtPublic::from_bytes(&key.public).unwrap();
        verify_signature(&public, &key.certify_info, &key.signature).unwrap();
    }
}

#[test]
fn test_short_response_activates_nothing() {
    let mut anchor = SoftwareAnchor::new();
    let mut backend = FakeBackend {
        withhold: 1,
        ..Default::default()
    };
    let result = enroll(&mut anchor, &two_key_configuration(), &[], &mut backend);
    assert!(matches!(result, Err(Error::ApiResponse(_))));
    assert_eq!(anchor.loaded_objects(), 0);
}

#[test]
fn test_primary_activation_failure_is_fatal() {
    let mut anchor = SoftwareAnchor::new();
    let mut backend = FakeBackend {
        corrupt: vec!["aik".into()],
        ..Default::default()
    };
    let result = enroll(&mut anchor, &two_key_configuration(), &[], &mut backend);
    assert!(matches!(result, Err(Error::Aik(_))));
    assert_eq!(anchor.loaded_objects(), 0);
}

#[test]
fn test_secondary_activation_failure_degrades() {
    let mut anchor = SoftwareAnchor::new();
    let mut backend = FakeBackend {
        corrupt: vec!["signer".into()],
        ..Default::default()
    };
    let enrollment = enroll(&mut anchor, &two_key_configuration(), &[], &mut backend).unwrap();
    assert!(enrollment.is_degraded());
    assert_eq!(enrollment.activated, vec!["aik".to_string()]);
    assert!(enrollment.failed.contains_key("signer"));

    let signer = &enrollment.state.keys["signer"];
    assert!(!signer.is_activated());
    assert!(!signer.private.is_empty());
}

#[test]
fn test_primary_key_must_be_configured() {
    let mut anchor = SoftwareAnchor::new();
    let configuration = Configuration {
        primary_key: "missing".into(),
        ..Default::default()
    };
    let mut backend = FakeBackend::default();
    assert!(matches!(
        enroll(&mut anchor, &configuration, &[], &mut backend),
        Err(Error::Aik(_))
    ));
    assert!(backend.requests.is_empty());
}

#[test]
fn test_endorsement_auth_is_required() {
    let mut anchor = SoftwareAnchor::new();
    anchor.set_endorsement_auth(b"owner");
    let mut backend = FakeBackend::default();
    let configuration = Configuration::default();

    assert!(matches!(
        enroll(&mut anchor, &configuration, b"wrong", &mut backend),
        Err(Error::RootKey(_))
    ));
    assert_eq!(anchor.loaded_objects(), 0);

    let enrollment = enroll(&mut anchor, &configuration, b"owner", &mut backend).unwrap();
    assert_eq!(enrollment.activated, vec!["aik".to_string()]);
}

#[test]
fn test_backend_errors_pass_through() {
    let mut anchor = SoftwareAnchor::new();
    let mut backend = FakeBackend {
        enroll_error: Some(ApiError::PaymentRequired),
        ..Default::default()
    };
    assert!(matches!(
        enroll(&mut anchor, &Configuration::default(), &[], &mut backend),
        Err(Error::Api(ApiError::PaymentRequired))
    ));

    let mut backend = FakeBackend {
        enroll_error: Some(ApiError::Other(anyhow::anyhow!("socket closed"))),
        ..Default::default()
    };
    assert!(matches!(
        enroll(&mut anchor, &Configuration::default(), &[], &mut backend),
        Err(Error::Unknown(_))
    ));
    assert_eq!(anchor.loaded_objects(), 0);
}

#[test]
fn test_ek_certificate_is_forwarded() {
    let mut anchor = SoftwareAnchor::new();
    anchor.set_ek_certificate(Some(vec![0x30, 0x82, 0x01, 0x00]));
    let mut backend = FakeBackend::default();
    let enrollment = enroll(&mut anchor, &Configuration::default(), &[], &mut backend).unwrap();
    assert_eq!(
        backend.requests[0].ek_certificate.as_deref(),
        Some(&[0x30, 0x82, 0x01, 0x00][..])
    );
    assert_eq!(
        enrollment.state.ek_certificate,
        backend.requests[0].ek_certificate
    );
}

#[test]
fn test_enroll_device_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        tpm: "dummy".into(),
        state_file: dir.path().join("state.json"),
        ..Default::default()
    };
    let mut backend = FakeBackend::default();
    let enrollment =
        enroll_device(&config, &Configuration::default(), None, &mut backend).unwrap();
    config.save_state(&enrollment.state).unwrap();

    let loaded: KeyHierarchyState = config.load_state().unwrap().unwrap();
    assert_eq!(loaded, enrollment.state);
    assert_eq!(loaded.keys["aik"], enrollment.state.keys["aik"]);
}
