use dicom_ulp::association::{
    client::ClientAssociationOptions, server::ServerAssociationOptions, AcceptorPolicy,
    CloseReason, Error, ErrorKind, State,
};
use dicom_ulp::dimse::Command;
use dicom_ulp::pdu::{
    AssociationRJServiceUserReason, AssociationRJSource, PresentationContextNegotiated,
    PresentationContextResultReason,
};
use dicom_ulp::service::{ActiveAssociation, DispatcherConfig, ServiceRegistry};
use matches::matches;
use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

/// Run an echo SCP for one association,
/// returning how the association was closed.
fn spawn_echo_scp(
    scp: ServerAssociationOptions,
) -> Result<(JoinHandle<Result<Option<CloseReason>>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let h = spawn(move || -> Result<_> {
        let (stream, _addr) = listener.accept()?;
        let association = scp.establish(stream)?;
        let active = ActiveAssociation::start(
            association,
            ServiceRegistry::new().with_verification(),
            DispatcherConfig::default(),
        )?;
        active.wait_for_close();
        Ok(active.association().close_reason())
    });
    Ok((h, addr))
}

#[test]
fn negotiation_is_deterministic() {
    let rq = ClientAssociationOptions::new()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .with_presentation_context(DIGITAL_MG_STORAGE_SOP_CLASS, vec![JPEG_BASELINE, IMPLICIT_VR_LE])
        .build_request()
        .unwrap();
    let policy = AcceptorPolicy::new().with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let first = policy.negotiate(&rq).unwrap();
    let second = policy.negotiate(&rq).unwrap();
    assert_eq!(first, second);

    let results: Vec<_> = first
        .presentation_contexts
        .iter()
        .map(|pc| (pc.id, pc.reason, pc.transfer_syntax.as_str()))
        .collect();
    assert_eq!(
        results,
        vec![
            (1, PresentationContextResultReason::Acceptance, EXPLICIT_VR_LE),
            // the first proposed transfer syntax is echoed back
            (
                3,
                PresentationContextResultReason::AbstractSyntaxNotSupported,
                JPEG_BASELINE
            ),
        ]
    );
}

/// The requestor proposes two transfer syntaxes,
/// the acceptor supports only the second one.
#[test]
fn scu_scp_echo_and_release() {
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_transfer_syntaxes(VERIFICATION_SOP_CLASS, [IMPLICIT_VR_LE]);
    let (scp_handle, scp_addr) = spawn_echo_scp(scp).unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .with_presentation_context(
            DIGITAL_MG_STORAGE_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE, JPEG_BASELINE],
        )
        .establish_tcp(scp_addr)
        .unwrap();

    assert_eq!(association.state(), State::Established);
    assert_eq!(
        association.presentation_contexts(),
        vec![
            PresentationContextNegotiated {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            },
            PresentationContextNegotiated {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                abstract_syntax: DIGITAL_MG_STORAGE_SOP_CLASS.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            },
        ]
    );

    let active = ActiveAssociation::start(
        association,
        ServiceRegistry::new(),
        DispatcherConfig::default(),
    )
    .unwrap();
    let response = active
        .invoke_future(1, Command::echo_rq(0), None)
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(response.presentation_context_id, 1);
    assert_eq!(response.command.status(), Some(0x0000));
    assert_eq!(response.command.message_id_being_responded_to(), Some(1));
    assert_eq!(response.data, None);

    active.release(true).expect("did not have a peaceful release");
    assert_eq!(active.outstanding_invocations(), 0);
    assert_eq!(active.association().state(), State::Idle);
    assert_eq!(active.association().close_reason(), Some(CloseReason::Released));

    let scp_reason = scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
    assert_eq!(scp_reason, Some(CloseReason::Released));
}

#[test]
fn wrong_called_ae_title_is_rejected() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);
    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        scp.establish(stream)
    });

    let err = ClientAssociationOptions::new()
        .called_ae_title("SOMEONE-ELSE")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish_tcp(addr)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    match err {
        Error::Rejected { association_rj, .. } => assert_eq!(
            association_rj.source,
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        ),
        e => panic!("Unexpected error {:?}", e),
    }

    let scp_result = h.join().expect("SCP panicked");
    assert!(matches!(scp_result, Err(Error::Rejected { .. })));
}

#[test]
fn no_accepted_presentation_context_fails() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION_SOP_CLASS);
    let h = spawn(move || -> Result<Option<CloseReason>> {
        let (stream, _addr) = listener.accept()?;
        let association = scp.establish(stream)?;
        // the requestor aborts right away
        let err = association.receive().unwrap_err();
        assert!(matches!(err, Error::Aborted { .. }));
        Ok(association.close_reason())
    });

    let err = ClientAssociationOptions::new()
        .with_abstract_syntax(DIGITAL_MG_STORAGE_SOP_CLASS)
        .establish_tcp(addr)
        .unwrap_err();
    assert!(matches!(err, Error::NoAcceptedPresentationContexts { .. }));

    let scp_reason = h.join().expect("SCP panicked").expect("Error at the SCP");
    assert!(matches!(scp_reason, Some(CloseReason::Aborted { .. })));
}

#[test]
fn peer_abort_completes_futures() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION_SOP_CLASS);
    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let association = scp.establish(stream)?;
        // never answer, abort once the request arrives
        let pdu = association.receive()?;
        assert!(matches!(pdu, dicom_ulp::Pdu::PData { .. }));
        association.abort()?;
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish_tcp(addr)
        .unwrap();
    let active = ActiveAssociation::start(
        association,
        ServiceRegistry::new(),
        DispatcherConfig::default(),
    )
    .unwrap();
    let future = active.invoke_future(1, Command::echo_rq(0), None).unwrap();
    let err = future.get().unwrap_err();
    assert!(matches!(
        err,
        dicom_ulp::service::Error::Closed {
            reason: Some(CloseReason::Aborted { .. }),
            ..
        }
    ));
    active.wait_for_close();
    // no invocations on a closed association
    assert!(active
        .invoke_future(1, Command::echo_rq(0), None)
        .is_err());
    h.join().expect("SCP panicked").expect("Error at the SCP");
}
