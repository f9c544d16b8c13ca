//! Full socket-based integration tests for the Koinonia shared-object
//! service: server-authoritative values, version-ordered replacement, and
//! the dynamic-namespace lifecycle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use collab_client::client::CollabClient;
use collab_client::plugins::koinonia::{KoinoniaClient, NamespaceCallbacks};
use collab_client::plugins::PluginClient;
use collab_server::CollabServer;
use collab_shared::config::{ServerConfig, ServerUri};
use collab_shared::datatype::{AtomicType, DataType, TypeId, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

async fn start_server() -> anyhow::Result<ServerUri> {
    let (server, addr) = CollabServer::bind_ephemeral(ServerConfig::default()).await?;
    tokio::spawn(server.run(None));
    Ok(uri_for(addr))
}

fn uri_for(addr: SocketAddr) -> ServerUri {
    ServerUri {
        password: None,
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A structure of one flag and one count: `{ Bool, SInt32 }`.
fn config_dictionary() -> (DataType, TypeId) {
    let mut dictionary = DataType::new();
    let ty = dictionary
        .create_structure(&[AtomicType::Bool.id(), AtomicType::SInt32.id()])
        .unwrap();
    (dictionary, ty)
}

fn config_value(flag: bool, n: i32) -> Value {
    Value::Structure(vec![Value::Bool(flag), Value::SInt32(n)])
}

/// The first registration's value wins: a second subscriber submitting a
/// different value has its local copy overwritten by the stored one at
/// the stored version.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_value_wins_for_second_subscriber() -> anyhow::Result<()> {
    init_tracing();
    let uri = start_server().await?;
    let (dictionary, ty) = config_dictionary();

    let alice_koinonia = Arc::new(KoinoniaClient::new(0));
    let _alice = CollabClient::connect(
        &uri,
        "alice",
        vec![alice_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let alice_object = alice_koinonia.share_object(
        "cfg",
        dictionary.clone(),
        ty,
        config_value(true, 5),
        Arc::new(|_, _| {}),
    )?;
    wait_until("alice's object to reach the server", || {
        alice_koinonia.shared_object_synced(alice_object)
    })
    .await;

    let bob_updates: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let bob_log = bob_updates.clone();
    let bob_koinonia = Arc::new(KoinoniaClient::new(0));
    let mut bob = CollabClient::connect(
        &uri,
        "bob",
        vec![bob_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let bob_object = bob_koinonia.share_object(
        "cfg",
        dictionary.clone(),
        ty,
        config_value(false, 0),
        Arc::new(move |_, value| bob_log.lock().unwrap().push(value.clone())),
    )?;

    wait_until("bob's copy to be overwritten by the stored value", || {
        bob.drain_frontend().unwrap();
        !bob_updates.lock().unwrap().is_empty()
    })
    .await;

    assert_eq!(bob_updates.lock().unwrap()[0], config_value(true, 5));
    assert_eq!(
        bob_koinonia.shared_object_value(bob_object),
        Some(config_value(true, 5))
    );
    assert_eq!(bob_koinonia.shared_object_version(bob_object), Some(0));
    Ok(())
}

/// Two replacements on the same object arrive at the other subscriber in
/// version order, with no interleaving.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replacements_delivered_in_version_order() -> anyhow::Result<()> {
    init_tracing();
    let uri = start_server().await?;
    let (dictionary, ty) = config_dictionary();

    let alice_koinonia = Arc::new(KoinoniaClient::new(0));
    let _alice = CollabClient::connect(
        &uri,
        "alice",
        vec![alice_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let alice_object = alice_koinonia.share_object(
        "cfg",
        dictionary.clone(),
        ty,
        config_value(true, 0),
        Arc::new(|_, _| {}),
    )?;
    wait_until("alice's object to reach the server", || {
        alice_koinonia.shared_object_synced(alice_object)
    })
    .await;

    let bob_updates: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let bob_log = bob_updates.clone();
    let bob_koinonia = Arc::new(KoinoniaClient::new(0));
    let mut bob = CollabClient::connect(
        &uri,
        "bob",
        vec![bob_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let bob_object = bob_koinonia.share_object(
        "cfg",
        dictionary.clone(),
        ty,
        config_value(true, 0),
        Arc::new(move |_, value| bob_log.lock().unwrap().push(value.clone())),
    )?;
    wait_until("bob's subscription to reach the server", || {
        bob.drain_frontend().unwrap();
        bob_koinonia.shared_object_synced(bob_object)
    })
    .await;
    // Subscribing delivered the stored value; only the replacements below
    // matter for the ordering check.
    bob_updates.lock().unwrap().clear();

    alice_koinonia.replace_shared_object(alice_object, config_value(true, 1))?;
    alice_koinonia.replace_shared_object(alice_object, config_value(true, 2))?;

    wait_until("bob to observe both replacements", || {
        bob.drain_frontend().unwrap();
        bob_updates.lock().unwrap().len() >= 2
    })
    .await;

    let updates = bob_updates.lock().unwrap().clone();
    assert_eq!(updates[0], config_value(true, 1));
    assert_eq!(updates[1], config_value(true, 2));
    assert_eq!(bob_koinonia.shared_object_version(bob_object), Some(2));
    Ok(())
}

/// Objects shared before the client connects are buffered and announced
/// once the plug-in starts.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn objects_shared_before_connect_flush_on_start() -> anyhow::Result<()> {
    init_tracing();
    let uri = start_server().await?;
    let (dictionary, ty) = config_dictionary();

    // Share first, connect second.
    let alice_koinonia = Arc::new(KoinoniaClient::new(0));
    let alice_object = alice_koinonia.share_object(
        "prefs",
        dictionary.clone(),
        ty,
        config_value(true, 11),
        Arc::new(|_, _| {}),
    )?;
    assert!(!alice_koinonia.shared_object_synced(alice_object));

    let _alice = CollabClient::connect(
        &uri,
        "alice",
        vec![alice_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    wait_until("the buffered object to reach the server", || {
        alice_koinonia.shared_object_synced(alice_object)
    })
    .await;

    // A later subscriber receives the buffered value.
    let bob_updates: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let bob_log = bob_updates.clone();
    let bob_koinonia = Arc::new(KoinoniaClient::new(0));
    let mut bob = CollabClient::connect(
        &uri,
        "bob",
        vec![bob_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    bob_koinonia.share_object(
        "prefs",
        dictionary,
        ty,
        config_value(false, 0),
        Arc::new(move |_, value| bob_log.lock().unwrap().push(value.clone())),
    )?;
    wait_until("bob to adopt the stored value", || {
        bob.drain_frontend().unwrap();
        !bob_updates.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(bob_updates.lock().unwrap()[0], config_value(true, 11));
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum NsEvent {
    Created(Value),
    Replaced(u32, Value),
    Destroyed(Value),
}

fn logging_callbacks(log: Arc<Mutex<Vec<NsEvent>>>) -> NamespaceCallbacks {
    let created_log = log.clone();
    let replaced_log = log.clone();
    let destroyed_log = log;
    NamespaceCallbacks {
        create_object: Arc::new(|_, _, _| {}),
        created: Arc::new(move |_, _, value| {
            created_log.lock().unwrap().push(NsEvent::Created(value.clone()));
        }),
        replaced: Arc::new(move |_, _, version, value| {
            replaced_log
                .lock()
                .unwrap()
                .push(NsEvent::Replaced(version, value.clone()));
        }),
        destroyed: Arc::new(move |_, _, value| {
            destroyed_log.lock().unwrap().push(NsEvent::Destroyed(value));
        }),
    }
}

/// Namespace lifecycle across two clients: a later subscriber is caught
/// up on existing objects, then observes replacement and destruction.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn namespace_catchup_replace_and_destroy() -> anyhow::Result<()> {
    init_tracing();
    let uri = start_server().await?;
    let (dictionary, ty) = config_dictionary();

    let alice_koinonia = Arc::new(KoinoniaClient::new(0));
    let _alice = CollabClient::connect(
        &uri,
        "alice",
        vec![alice_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let alice_ns = alice_koinonia.share_namespace(
        "scene",
        dictionary.clone(),
        NamespaceCallbacks::noop(),
    )?;
    let alice_obj = alice_koinonia.create_ns_object(alice_ns, ty, config_value(true, 7))?;
    wait_until("alice's namespace object to reach the server", || {
        alice_koinonia.ns_object_synced(alice_ns, alice_obj)
    })
    .await;

    let bob_events: Arc<Mutex<Vec<NsEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let bob_koinonia = Arc::new(KoinoniaClient::new(0));
    let mut bob = CollabClient::connect(
        &uri,
        "bob",
        vec![bob_koinonia.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let bob_ns = bob_koinonia.share_namespace(
        "scene",
        dictionary,
        logging_callbacks(bob_events.clone()),
    )?;

    // Catch-up: the existing object materializes on bob's side.
    wait_until("bob to be caught up on the existing object", || {
        bob.drain_frontend().unwrap();
        !bob_events.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(
        bob_events.lock().unwrap()[0],
        NsEvent::Created(config_value(true, 7))
    );
    assert_eq!(bob_koinonia.ns_objects(bob_ns).len(), 1);

    alice_koinonia.replace_ns_object(alice_ns, alice_obj, config_value(false, 8))?;
    wait_until("bob to observe the replacement", || {
        bob.drain_frontend().unwrap();
        bob_events.lock().unwrap().len() >= 2
    })
    .await;
    assert_eq!(
        bob_events.lock().unwrap()[1],
        NsEvent::Replaced(1, config_value(false, 8))
    );

    alice_koinonia.destroy_ns_object(alice_ns, alice_obj)?;
    wait_until("bob to observe the destruction", || {
        bob.drain_frontend().unwrap();
        bob_events.lock().unwrap().len() >= 3
    })
    .await;
    assert_eq!(
        bob_events.lock().unwrap()[2],
        NsEvent::Destroyed(config_value(false, 8))
    );
    assert!(bob_koinonia.ns_objects(bob_ns).is_empty());
    Ok(())
}
