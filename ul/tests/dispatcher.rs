use dicom_ulp::association::{
    client::ClientAssociationOptions, server::ServerAssociationOptions, Association, CloseReason,
    State,
};
use dicom_ulp::dimse::{Command, CommandField, DataSetReader, Status};
use dicom_ulp::service::{
    ActiveAssociation, DimseService, DispatcherConfig, ServiceRegistry,
};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.2";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// A counting semaphore for holding back the SCP.
#[derive(Default)]
struct Gate {
    permits: Mutex<usize>,
    changed: Condvar,
}

impl Gate {
    fn open(&self, permits: usize) {
        *self.permits.lock().unwrap() += permits;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.changed.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

/// Echo service answering only once let through the gate.
struct GatedEcho {
    gate: Arc<Gate>,
    arrived: Arc<AtomicUsize>,
}

impl DimseService for GatedEcho {
    fn on_request(
        &self,
        association: &ActiveAssociation,
        presentation_context_id: u8,
        command: Command,
        _data: Option<DataSetReader<'_>>,
    ) -> dicom_ulp::service::Result<()> {
        self.arrived.fetch_add(1, Ordering::SeqCst);
        self.gate.pass();
        let rsp = Command::response_to(&command, Status::SUCCESS).unwrap();
        association.write_response(presentation_context_id, &rsp, None)
    }
}

/// Echo service answering only when the request is cancelled.
struct CancelableEcho;

impl DimseService for CancelableEcho {
    fn on_request(
        &self,
        association: &ActiveAssociation,
        presentation_context_id: u8,
        command: Command,
        _data: Option<DataSetReader<'_>>,
    ) -> dicom_ulp::service::Result<()> {
        let message_id = command.message_id().unwrap();
        let gate = Arc::new(Gate::default());
        let cancelled = Arc::clone(&gate);
        association.register_cancel_listener(
            message_id,
            Arc::new(move |_pc: u8, _id: u16| cancelled.open(1)),
        );
        let pending = Command::response_to(&command, Status::PENDING).unwrap();
        association.write_response(presentation_context_id, &pending, None)?;
        gate.pass();
        assert!(association.remove_cancel_listener(message_id));
        let rsp = Command::response_to(&command, Status::CANCEL).unwrap();
        association.write_response(presentation_context_id, &rsp, None)
    }
}

/// Run an SCP with a (2, 2) asynchronous operations window,
/// returning the dispatcher once the association is closed.
fn spawn_scp(registry: ServiceRegistry) -> (JoinHandle<Result<ActiveAssociation>>, Association) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntaxes(CT_IMAGE_STORAGE_SOP_CLASS, [IMPLICIT_VR_LE])
        .async_operations_window(2, 2);

    let h = spawn(move || -> Result<_> {
        let (stream, _addr) = listener.accept()?;
        let association = scp.establish(stream)?;
        let active = ActiveAssociation::start(association, registry, DispatcherConfig::default())?;
        active.wait_for_close();
        Ok(active)
    });

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_presentation_context(CT_IMAGE_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .async_operations_window(2, 2)
        .establish_tcp(addr)
        .unwrap();
    (h, association)
}

fn start(association: Association) -> ActiveAssociation {
    ActiveAssociation::start(association, ServiceRegistry::new(), DispatcherConfig::default())
        .unwrap()
}

#[test]
fn third_invocation_waits_for_capacity() {
    let gate = Arc::new(Gate::default());
    let arrived = Arc::new(AtomicUsize::new(0));
    let registry = ServiceRegistry::new().with_service(
        VERIFICATION_SOP_CLASS,
        GatedEcho {
            gate: Arc::clone(&gate),
            arrived: Arc::clone(&arrived),
        },
    );
    let (scp_handle, association) = spawn_scp(registry);
    let active = start(association);
    assert_eq!(
        active.association().async_ops_window().max_operations_invoked,
        2
    );

    let first = active.invoke_future(1, Command::echo_rq(0), None).unwrap();
    let second = active.invoke_future(1, Command::echo_rq(0), None).unwrap();
    assert_eq!(active.outstanding_invocations(), 2);

    let invoked = Arc::new(AtomicBool::new(false));
    let third = {
        let active = active.clone();
        let invoked = Arc::clone(&invoked);
        spawn(move || {
            let future = active.invoke_future(1, Command::echo_rq(0), None).unwrap();
            invoked.store(true, Ordering::SeqCst);
            future.get().unwrap()
        })
    };

    // both requests are performed concurrently
    while arrived.load(Ordering::SeqCst) < 2 {
        sleep(Duration::from_millis(10));
    }
    sleep(Duration::from_millis(200));
    assert!(!invoked.load(Ordering::SeqCst));

    gate.open(1);
    while !first.is_ready() && !second.is_ready() {
        sleep(Duration::from_millis(10));
    }
    let done = first.peek().or_else(|| second.peek()).unwrap();
    assert_eq!(done.command.status(), Some(0x0000));

    gate.open(2);
    let rsp = third.join().unwrap();
    assert!(invoked.load(Ordering::SeqCst));
    assert_eq!(rsp.command.status(), Some(0x0000));
    assert!(first.get().is_ok());
    assert!(second.get().is_ok());

    active.release(true).unwrap();
    assert_eq!(active.association().state(), State::Idle);
    scp_handle.join().unwrap().unwrap();
}

#[test]
fn message_ids_increase() {
    let (scp_handle, association) =
        spawn_scp(ServiceRegistry::new().with_verification());
    let active = start(association);

    let mut last = 0;
    for _ in 0..5 {
        let rsp = active
            .invoke_future(1, Command::echo_rq(0), None)
            .unwrap()
            .get()
            .unwrap();
        let id = rsp.command.message_id_being_responded_to().unwrap();
        assert!(id > last);
        last = id;
    }

    // an explicit message ID is kept, and seen by the peer
    let rsp = active
        .invoke_future(1, Command::echo_rq(100), None)
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(rsp.command.message_id_being_responded_to(), Some(100));

    active.release(true).unwrap();
    let scp = scp_handle.join().unwrap().unwrap();
    assert!(scp.association().next_message_id() > 100);
}

#[test]
fn unregistered_sop_class_is_refused() {
    let (scp_handle, association) =
        spawn_scp(ServiceRegistry::new().with_verification());
    let active = start(association);
    let pc = active
        .association()
        .presentation_context_for(CT_IMAGE_STORAGE_SOP_CLASS)
        .unwrap();

    let store_rq = Command::new(CommandField::CStoreRq)
        .with_affected_sop_class_uid(CT_IMAGE_STORAGE_SOP_CLASS)
        .with_affected_sop_instance_uid("1.2.3.4")
        .with_priority(0);
    let mut data = vec![0_u8; 64];
    let rsp = active
        .invoke_future(pc.id, store_rq, Some(&mut data))
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(rsp.command.command_field(), Some(CommandField::CStoreRsp));
    assert_eq!(rsp.command.status_code(), Some(Status::NO_SUCH_SOP_CLASS));
    assert_eq!(
        rsp.command.affected_sop_instance_uid().as_deref(),
        Some("1.2.3.4")
    );

    // the association is still usable
    let rsp = active
        .invoke_future(1, Command::echo_rq(0), None)
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(rsp.command.status(), Some(0x0000));

    active.release(true).unwrap();
    scp_handle.join().unwrap().unwrap();
}

#[test]
fn cancel_reaches_the_performing_service() {
    let (scp_handle, association) =
        spawn_scp(ServiceRegistry::new().with_service(VERIFICATION_SOP_CLASS, CancelableEcho));
    let active = start(association);

    let future = active.invoke_future(1, Command::echo_rq(42), None).unwrap();
    while future.list_pending().is_empty() {
        sleep(Duration::from_millis(10));
    }
    assert!(!future.is_ready());

    active.cancel(1, 42).unwrap();
    let rsp = future.get().unwrap();
    assert_eq!(rsp.command.status_code(), Some(Status::CANCEL));
    assert_eq!(future.list_pending().len(), 1);

    active.release(true).unwrap();
    scp_handle.join().unwrap().unwrap();
}

#[test]
fn acceptor_answers_release_after_pending_operations() {
    let gate = Arc::new(Gate::default());
    let arrived = Arc::new(AtomicUsize::new(0));
    let registry = ServiceRegistry::new().with_service(
        VERIFICATION_SOP_CLASS,
        GatedEcho {
            gate: Arc::clone(&gate),
            arrived: Arc::clone(&arrived),
        },
    );
    let (scp_handle, association) = spawn_scp(registry);
    let active = start(association);

    let future = active.invoke_future(1, Command::echo_rq(0), None).unwrap();
    while arrived.load(Ordering::SeqCst) < 1 {
        sleep(Duration::from_millis(10));
    }
    let opener = {
        let gate = Arc::clone(&gate);
        spawn(move || {
            sleep(Duration::from_millis(100));
            gate.open(1);
        })
    };

    // release without waiting, the response still comes through
    active.release(false).unwrap();
    let rsp = future.get().unwrap();
    assert_eq!(rsp.command.status(), Some(0x0000));
    assert_eq!(
        active.association().close_reason(),
        Some(CloseReason::Released)
    );

    opener.join().unwrap();
    let scp = scp_handle.join().unwrap().unwrap();
    assert_eq!(scp.association().close_reason(), Some(CloseReason::Released));
}
