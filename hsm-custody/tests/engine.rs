use alloy_primitives::{address, Address, Bytes, U256};
use hsm_custody::device::{Device, DeviceOperation, MemoryDevice, SignatureQuirk, UserType};
use hsm_custody::signature::is_low_s;
use hsm_custody::{
    Credentials, CustodyError, EngineConfig, ErrorKind, LowSStrategy, PolicyDenial,
    PolicyRequest, SignedTransaction, SigningEngine, Step, UnsignedTransaction,
};
use pkcs11::types::{CKR_DEVICE_ERROR, CKR_FUNCTION_FAILED, CKR_SESSION_COUNT};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

fn credentials() -> Credentials {
    Credentials::new("crypto-user", "correct horse", "so-secret")
}

fn engine_with(
    device: &Arc<MemoryDevice>,
    config: EngineConfig,
) -> SigningEngine<Arc<MemoryDevice>> {
    setup_tracing();
    SigningEngine::new(device.clone(), credentials(), config).unwrap()
}

fn engine(slots: usize) -> (Arc<MemoryDevice>, SigningEngine<Arc<MemoryDevice>>) {
    let device = Arc::new(MemoryDevice::new(slots));
    let engine = engine_with(&device, EngineConfig::default());
    (device, engine)
}

fn transfer() -> UnsignedTransaction {
    UnsignedTransaction {
        nonce: 1,
        gas_price: U256::from(100),
        gas_limit: 100,
        to: Some(address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")),
        value: U256::from(1000),
        data: Bytes::new(),
    }
}

fn assert_sessions_released(device: &MemoryDevice) {
    assert_eq!(device.open_sessions(), 0);
    assert_eq!(device.active_searches(), 0);
    assert_eq!(device.sessions_opened(), device.close_calls());
}

#[test]
fn created_address_is_stable() {
    let (device, engine) = engine(4);
    let created = engine.create_address("cold-1").unwrap();
    assert_eq!(created.label.as_deref(), Some("cold-1"));
    assert_eq!(engine.get_address_by_label("cold-1").unwrap(), created);
    assert_eq!(engine.get_address_by_label("cold-1").unwrap(), created);
    assert_sessions_released(&device);

    let policy = device.private_key_policy(0).unwrap();
    assert!(!policy.extractable);
    assert!(policy.sensitive);
}

#[test]
fn duplicate_label_leaves_the_key_untouched() {
    let (device, engine) = engine(4);
    let created = engine.create_address("hot-1").unwrap();
    assert_eq!(device.object_count(0), 2);

    let err = engine.create_address("hot-1").unwrap_err();
    assert!(matches!(err, CustodyError::DuplicateLabel { ref label } if label == "hot-1"));
    assert_eq!(err.kind(), ErrorKind::DuplicateLabel);
    assert!(err.kind().is_client_error());
    assert_eq!(device.object_count(0), 2);
    assert_eq!(device.object_count(1), 0);
    assert_eq!(engine.get_address_by_label("hot-1").unwrap(), created);
}

#[test]
fn treasury_scenario() {
    let (device, engine) = engine(2);
    let created = engine.create_address("treasury-1").unwrap();

    let signed = engine
        .sign_transaction(&transfer(), 3, "treasury-1")
        .unwrap();
    assert_eq!(signed.recover_signer().unwrap(), created.address);
    assert_eq!(signed.chain_id(), 3);
    assert!(is_low_s(signed.signature().signature()));
    assert_eq!(
        signed.v(),
        35 + 2 * 3 + u64::from(signed.signature().y_parity())
    );

    let decoded = SignedTransaction::decode(&signed.encode()).unwrap();
    assert_eq!(decoded, signed);
    assert_eq!(decoded.transaction(), &transfer());
    assert_sessions_released(&device);
}

#[test]
fn encoded_signing_returns_the_wire_form() {
    let (_, engine) = engine(1);
    let created = engine.create_address("encoded").unwrap();
    let raw = engine
        .sign_transaction_encoded(&transfer(), 1, "encoded")
        .unwrap();
    let decoded = SignedTransaction::decode(&raw).unwrap();
    assert_eq!(decoded.recover_signer().unwrap(), created.address);
}

#[test]
fn unknown_label_is_not_found() {
    let (device, engine) = engine(2);
    engine.create_address("known").unwrap();

    let err = engine
        .sign_transaction(&transfer(), 3, "unknown")
        .unwrap_err();
    assert!(matches!(err, CustodyError::SlotNotFound { .. }));
    assert_eq!(err.kind().code(), "slot_not_found");
    assert!(matches!(
        engine.get_address_by_label("unknown"),
        Err(CustodyError::SlotNotFound { .. })
    ));
    assert_sessions_released(&device);
}

#[test]
fn slot_without_keys_reports_key_not_found() {
    let (device, engine) = engine(2);
    device.init_token(1, "so-secret", "empty").unwrap();
    let session = device.open_session(1).unwrap();
    device
        .login(session, UserType::SecurityOfficer, "so-secret")
        .unwrap();
    device
        .init_pin(session, &credentials().operator_pin())
        .unwrap();
    device.close_session(session).unwrap();

    assert!(matches!(
        engine.get_address_by_label("empty"),
        Err(CustodyError::KeyNotFound { slot: 1, .. })
    ));
    assert_eq!(device.open_sessions(), 0);
    assert_eq!(device.active_searches(), 0);
}

#[test]
fn slot_address_matches_labelled_address() {
    let (_, engine) = engine(3);
    engine.create_address("first").unwrap();
    let second = engine.create_address("second").unwrap();

    let by_slot = engine.get_address_by_slot(1).unwrap();
    assert_eq!(by_slot.address, second.address);
    assert_eq!(by_slot.label, None);

    let labels = engine.labels().unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[1].label, "second");
}

#[test]
fn fault_during_signing_still_closes_the_session() {
    let (device, engine) = engine(1);
    engine.create_address("faulty").unwrap();

    device.fail_next(DeviceOperation::Sign, CKR_DEVICE_ERROR);
    let err = engine
        .sign_transaction(&transfer(), 1, "faulty")
        .unwrap_err();
    assert!(matches!(
        err,
        CustodyError::Device {
            step: Step::Sign,
            slot: Some(0),
            ..
        }
    ));
    assert!(!err.kind().is_client_error());
    assert_sessions_released(&device);

    // The next attempt, in a fresh session, succeeds.
    assert!(engine.sign_transaction(&transfer(), 1, "faulty").is_ok());
}

#[test]
fn fault_reading_the_key_still_closes_the_session() {
    let (device, engine) = engine(1);
    engine.create_address("reader").unwrap();

    device.fail_next(DeviceOperation::Attribute, CKR_FUNCTION_FAILED);
    assert!(matches!(
        engine.get_address_by_label("reader"),
        Err(CustodyError::Device {
            step: Step::ReadAttribute,
            ..
        })
    ));
    assert_sessions_released(&device);
}

#[test]
fn high_s_is_normalized_without_resigning() {
    let (device, engine) = engine(1);
    let created = engine.create_address("normalize").unwrap();
    let before = device.sign_calls();

    device.queue_signature_quirk(SignatureQuirk::HighS);
    let signed = engine
        .sign_transaction(&transfer(), 5, "normalize")
        .unwrap();
    assert_eq!(device.sign_calls(), before + 1);
    assert!(is_low_s(signed.signature().signature()));
    assert_eq!(signed.recover_signer().unwrap(), created.address);
}

#[test]
fn resign_strategy_retries_high_s() {
    let device = Arc::new(MemoryDevice::new(1));
    let engine = engine_with(
        &device,
        EngineConfig {
            low_s: LowSStrategy::resign(),
            ..EngineConfig::default()
        },
    );
    let created = engine.create_address("resign").unwrap();
    let before = device.sign_calls();

    device.queue_signature_quirk(SignatureQuirk::HighS);
    device.queue_signature_quirk(SignatureQuirk::HighS);
    let signed = engine.sign_transaction(&transfer(), 1, "resign").unwrap();
    assert_eq!(device.sign_calls(), before + 3);
    assert!(is_low_s(signed.signature().signature()));
    assert_eq!(signed.recover_signer().unwrap(), created.address);
}

#[test]
fn resign_strategy_gives_up() {
    let device = Arc::new(MemoryDevice::new(1));
    let engine = engine_with(
        &device,
        EngineConfig {
            low_s: LowSStrategy::Resign { max_attempts: 3 },
            ..EngineConfig::default()
        },
    );
    engine.create_address("stubborn").unwrap();

    for _ in 0..3 {
        device.queue_signature_quirk(SignatureQuirk::HighS);
    }
    assert!(matches!(
        engine.sign_transaction(&transfer(), 1, "stubborn"),
        Err(CustodyError::SignatureRetriesExhausted { attempts: 3 })
    ));
    assert_sessions_released(&device);
}

#[test]
fn signature_from_another_key_is_rejected() {
    let (device, engine) = engine(1);
    engine.create_address("impostor").unwrap();

    device.queue_signature_quirk(SignatureQuirk::ForeignKey);
    assert!(matches!(
        engine.sign_transaction(&transfer(), 1, "impostor"),
        Err(CustodyError::SignatureRecoveryFailed { slot: 0 })
    ));
    assert_sessions_released(&device);
}

#[test]
fn policy_denial_touches_nothing() {
    let device = Arc::new(MemoryDevice::new(2));
    let engine = engine_with(&device, EngineConfig::default()).with_policy(
        |request: &PolicyRequest<'_>| match request {
            PolicyRequest::CreateAddress { label } if label.starts_with("blocked") => {
                Err(PolicyDenial::new("label is blocked"))
            }
            PolicyRequest::SignTransaction { transaction, .. }
                if transaction.value > U256::from(10_000) =>
            {
                Err(PolicyDenial::new("value above approval threshold"))
            }
            _ => Ok(()),
        },
    );

    let err = engine.create_address("blocked-1").unwrap_err();
    assert_eq!(err.to_string(), "denied by policy: label is blocked");
    assert_eq!(err.kind(), ErrorKind::PolicyDenied);
    assert!(engine.labels().unwrap().is_empty());

    engine.create_address("allowed").unwrap();
    let opened = device.sessions_opened();
    let large = UnsignedTransaction {
        value: U256::from(1_000_000),
        ..transfer()
    };
    assert!(matches!(
        engine.sign_transaction(&large, 1, "allowed"),
        Err(CustodyError::PolicyDenied(_))
    ));
    assert_eq!(device.sessions_opened(), opened);
    assert!(engine.sign_transaction(&transfer(), 1, "allowed").is_ok());
}

#[test]
fn timeout_tears_the_session_down() {
    let device = Arc::new(MemoryDevice::new(1));
    engine_with(&device, EngineConfig::default())
        .create_address("slow")
        .unwrap();

    let engine = engine_with(
        &device,
        EngineConfig {
            operation_timeout: Some(Duration::ZERO),
            ..EngineConfig::default()
        },
    );
    let err = engine.sign_transaction(&transfer(), 1, "slow").unwrap_err();
    assert!(matches!(err, CustodyError::Timeout { .. }));
    assert_eq!(err.kind().code(), "timeout");
    assert_sessions_released(&device);

    assert!(matches!(
        engine.create_address("never"),
        Err(CustodyError::Timeout {
            step: Step::InitToken
        })
    ));
    assert_eq!(engine.labels().unwrap().len(), 1);
}

#[test]
fn full_device_has_no_free_slot() {
    let (_, engine) = engine(1);
    engine.create_address("only").unwrap();
    let err = engine.create_address("another").unwrap_err();
    assert!(matches!(err, CustodyError::NoFreeSlot));
}

#[test]
fn invalid_inputs_are_client_errors() {
    let (device, engine) = engine(1);
    let err = engine.create_address(" padded").unwrap_err();
    assert!(matches!(err, CustodyError::InvalidLabel { .. }));
    assert!(err.kind().is_client_error());

    engine.create_address("chain").unwrap();
    let opened = device.sessions_opened();
    assert!(matches!(
        engine.sign_transaction(&transfer(), 0, "chain"),
        Err(CustodyError::InvalidChainId(0))
    ));
    assert_eq!(device.sessions_opened(), opened);
}

#[test]
fn failed_pin_initialization_is_reported_as_incomplete() {
    let (device, engine) = engine(2);
    device.fail_next(DeviceOperation::InitPin, CKR_DEVICE_ERROR);

    match engine.create_address("half") {
        Err(CustodyError::ProvisioningIncomplete { slot, label, source }) => {
            assert_eq!(slot, 0);
            assert_eq!(label, "half");
            assert!(matches!(
                *source,
                CustodyError::Device {
                    step: Step::InitPin,
                    ..
                }
            ));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(device.open_sessions(), 0);

    // The token keeps its label; it is neither reused nor rolled back.
    assert!(matches!(
        engine.create_address("half"),
        Err(CustodyError::DuplicateLabel { .. })
    ));
    assert!(matches!(
        engine.get_address_by_label("half"),
        Err(CustodyError::Auth { slot: 0, .. })
    ));
    assert_eq!(engine.create_address("whole").unwrap().label.unwrap(), "whole");
}

#[test]
fn teardown_failure_does_not_fail_the_operation() {
    let (device, engine) = engine(1);
    let created = engine.create_address("sticky").unwrap();

    device.fail_next(DeviceOperation::Logout, CKR_DEVICE_ERROR);
    assert_eq!(engine.get_address_by_label("sticky").unwrap(), created);
    assert_eq!(device.open_sessions(), 0);
}

#[test]
fn wrong_credentials_fail_authentication() {
    let (device, engine) = engine(1);
    engine.create_address("guarded").unwrap();

    let intruder = SigningEngine::new(
        device.clone(),
        Credentials::new("crypto-user", "wrong", "so-secret"),
        EngineConfig::default(),
    )
    .unwrap();
    let err = intruder.get_address_by_label("guarded").unwrap_err();
    assert!(matches!(
        err,
        CustodyError::Auth {
            slot: 0,
            step: Step::Login,
            ..
        }
    ));
    assert!(!err.to_string().contains("wrong"));
    assert_eq!(device.open_sessions(), 0);
}

#[test]
fn session_limit_surfaces_as_device_error() {
    let device = Arc::new(MemoryDevice::new(1).with_max_sessions(1));
    let engine = engine_with(&device, EngineConfig::default());
    engine.create_address("busy").unwrap();

    let held = device.open_session(0).unwrap();
    let err = engine.get_address_by_label("busy").unwrap_err();
    assert!(matches!(
        err,
        CustodyError::Device {
            step: Step::OpenSession,
            ref source,
            ..
        } if source.return_value() == Some(CKR_SESSION_COUNT)
    ));
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    device.close_session(held).unwrap();
}

#[test]
fn concurrent_creation_of_one_label_provisions_once() {
    let (device, engine) = engine(8);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| scope.spawn(|| engine.create_address("contended")))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let created: Vec<Address> = results
        .iter()
        .filter_map(|result| result.as_ref().ok().map(|created| created.address))
        .collect();
    assert_eq!(created.len(), 1);
    assert!(results.iter().all(|result| matches!(
        result,
        Ok(_) | Err(CustodyError::DuplicateLabel { .. })
    )));
    assert_eq!(engine.labels().unwrap().len(), 1);
    assert_sessions_released(&device);
}

#[test]
fn concurrent_operations_use_independent_sessions() {
    let (device, engine) = engine(4);
    let labels = ["a", "b", "c", "d"];
    let addresses: Vec<Address> = thread::scope(|scope| {
        let engine = &engine;
        let handles: Vec<_> = labels
            .into_iter()
            .map(|label| scope.spawn(move || engine.create_address(label).unwrap().address))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    thread::scope(|scope| {
        for (label, address) in labels.iter().zip(&addresses) {
            let engine = &engine;
            scope.spawn(move || {
                for nonce in 0..4 {
                    let transaction = UnsignedTransaction {
                        nonce,
                        ..transfer()
                    };
                    let signed = engine.sign_transaction(&transaction, 1, label).unwrap();
                    assert_eq!(signed.recover_signer().unwrap(), *address);
                }
            });
        }
    });
    assert_sessions_released(&device);
}

#[test]
fn concurrent_signing_on_one_label_shares_the_login() {
    let (device, engine) = engine(1);
    let signer = engine.create_address("shared").unwrap().address;

    thread::scope(|scope| {
        for worker in 0..8u64 {
            let engine = &engine;
            scope.spawn(move || {
                for round in 0..25 {
                    let transaction = UnsignedTransaction {
                        nonce: worker * 100 + round,
                        ..transfer()
                    };
                    let signed = engine.sign_transaction(&transaction, 1, "shared").unwrap();
                    assert_eq!(signed.recover_signer().unwrap(), signer);
                }
            });
        }
    });
    assert_sessions_released(&device);
    assert_eq!(device.logged_in_as(0), None);
}
