//! Client half of the Koinonia shared-object plug-in.
//!
//! Objects are identified by a client-local ID from the moment they are
//! shared; the server-side ID arrives later with the reply. Requests
//! issued before the plug-in started, or before the relevant server-side
//! ID is known, are buffered and flushed when the missing piece arrives
//! (protocol started, namespace ID known, object ID known).
//!
//! The back end keeps the ID maps and versions current and forwards
//! host-order buffers to the front end, which materializes values and
//! fires the application callbacks on the application's thread. The state
//! mutex is the only structure both sides touch, and no callback runs
//! under it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use collab_shared::buffer::{MessageBuffer, MessageReader};
use collab_shared::datatype::{DataType, TypeId, Value};
use collab_shared::koinonia::{
    self, NamespaceId, ObjectId, VersionNumber, CREATE_NAMESPACE_REPLY, CREATE_NS_OBJECT_NOTIFICATION,
    CREATE_NS_OBJECT_REPLY, CREATE_OBJECT_REPLY, DESTROY_NS_OBJECT_NOTIFICATION,
    KOINONIA_PROTOCOL_NAME, KOINONIA_PROTOCOL_VERSION, NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
    REPLACE_NS_OBJECT_NOTIFICATION, REPLACE_NS_OBJECT_REPLY, REPLACE_OBJECT_NOTIFICATION,
    REPLACE_OBJECT_REPLY,
};
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::MessageId;
use collab_shared::socket::ReliableReader;

use crate::client::ClientHandle;
use crate::plugins::PluginClient;

/// Called on the application thread when the server updates a shared
/// object: `(client object id, new value)`. Shared so invocations never
/// run under the state lock.
pub type SharedObjectUpdatedCallback = Arc<dyn Fn(ObjectId, &Value) + Send + Sync>;

/// Application hooks for one shared namespace; all fire on the
/// application thread and receive client-local IDs.
pub struct NamespaceCallbacks {
    /// A peer created an object; fires before its value materializes.
    pub create_object: Arc<dyn Fn(NamespaceId, ObjectId, TypeId) + Send + Sync>,
    /// The new object's value is in memory.
    pub created: Arc<dyn Fn(NamespaceId, ObjectId, &Value) + Send + Sync>,
    /// A peer replaced an object's value.
    pub replaced: Arc<dyn Fn(NamespaceId, ObjectId, VersionNumber, &Value) + Send + Sync>,
    /// An object was destroyed; receives its final value.
    pub destroyed: Arc<dyn Fn(NamespaceId, ObjectId, Value) + Send + Sync>,
}

impl NamespaceCallbacks {
    /// Callbacks that ignore every event.
    pub fn noop() -> Self {
        NamespaceCallbacks {
            create_object: Arc::new(|_, _, _| {}),
            created: Arc::new(|_, _, _| {}),
            replaced: Arc::new(|_, _, _, _| {}),
            destroyed: Arc::new(|_, _, _| {}),
        }
    }
}

struct SharedObjectEntry {
    server_id: Option<ObjectId>,
    name: String,
    dictionary: DataType,
    type_id: TypeId,
    version: VersionNumber,
    value: Value,
    /// A replace was requested before the server-side ID arrived.
    dirty: bool,
    updated: SharedObjectUpdatedCallback,
}

/// Operation waiting for an object's server-side ID.
enum NsOp {
    Replace,
    Destroy,
}

struct NsObjectEntry {
    server_id: Option<ObjectId>,
    type_id: TypeId,
    version: VersionNumber,
    value: Value,
    pending: Vec<NsOp>,
    /// Destroyed locally; kept only until the destroy request can go out.
    doomed: bool,
}

struct NamespaceEntry {
    server_id: Option<NamespaceId>,
    name: String,
    dictionary: DataType,
    callbacks: NamespaceCallbacks,
    last_object_id: ObjectId,
    /// Keyed by client-local object ID.
    objects: HashMap<ObjectId, NsObjectEntry>,
    /// Server-side object ID to client-local ID.
    server_objects: HashMap<ObjectId, ObjectId>,
    /// Client-local IDs of objects awaiting the namespace's server ID.
    pending_creates: Vec<ObjectId>,
}

impl NamespaceEntry {
    fn allocate_object_id(&mut self) -> ObjectId {
        loop {
            self.last_object_id = self.last_object_id.wrapping_add(1);
            if self.last_object_id != 0 && !self.objects.contains_key(&self.last_object_id) {
                return self.last_object_id;
            }
        }
    }
}

#[derive(Default)]
struct KoinoniaClientState {
    started: bool,
    /// Client object IDs to announce once the protocol starts.
    startup_objects: Vec<ObjectId>,
    startup_namespaces: Vec<NamespaceId>,
    last_object_id: ObjectId,
    objects: HashMap<ObjectId, SharedObjectEntry>,
    server_objects: HashMap<ObjectId, ObjectId>,
    object_names: HashSet<String>,
    last_namespace_id: NamespaceId,
    namespaces: HashMap<NamespaceId, NamespaceEntry>,
    server_namespaces: HashMap<NamespaceId, NamespaceId>,
    namespace_names: HashSet<String>,
}

impl KoinoniaClientState {
    fn allocate_object_id(&mut self) -> ObjectId {
        loop {
            self.last_object_id = self.last_object_id.wrapping_add(1);
            if self.last_object_id != 0 && !self.objects.contains_key(&self.last_object_id) {
                return self.last_object_id;
            }
        }
    }

    fn allocate_namespace_id(&mut self) -> NamespaceId {
        loop {
            self.last_namespace_id = self.last_namespace_id.wrapping_add(1);
            if self.last_namespace_id != 0 && !self.namespaces.contains_key(&self.last_namespace_id)
            {
                return self.last_namespace_id;
            }
        }
    }

    fn object_by_server_id(&mut self, server_id: ObjectId) -> Result<(ObjectId, &mut SharedObjectEntry)> {
        let client_id = *self
            .server_objects
            .get(&server_id)
            .with_context(|| format!("unknown shared object {server_id}"))?;
        Ok((
            client_id,
            self.objects.get_mut(&client_id).expect("maps in sync"),
        ))
    }

    fn namespace_by_server_id(&mut self, server_id: NamespaceId) -> Result<(NamespaceId, &mut NamespaceEntry)> {
        let client_id = *self
            .server_namespaces
            .get(&server_id)
            .with_context(|| format!("unknown namespace {server_id}"))?;
        Ok((
            client_id,
            self.namespaces.get_mut(&client_id).expect("maps in sync"),
        ))
    }
}

pub struct KoinoniaClient {
    plugin_index: usize,
    bases: Mutex<Option<MessageBases>>,
    handle: Mutex<Option<ClientHandle>>,
    state: Mutex<KoinoniaClientState>,
}

impl KoinoniaClient {
    pub fn new(plugin_index: usize) -> Self {
        KoinoniaClient {
            plugin_index,
            bases: Mutex::new(None),
            handle: Mutex::new(None),
            state: Mutex::new(KoinoniaClientState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KoinoniaClientState> {
        self.state.lock().expect("koinonia state lock poisoned")
    }

    fn client_bases(&self) -> Result<MessageBases> {
        self.bases
            .lock()
            .expect("bases lock")
            .context("Koinonia plug-in was not negotiated")
    }

    fn send(&self, message: MessageBuffer) {
        let handle = self.handle.lock().expect("handle lock");
        if let Some(handle) = handle.as_ref() {
            handle.send(message);
        }
    }

    /* Globally named static objects. */

    /// Shares an object under a server-wide unique name; the callback
    /// fires whenever the server updates it. Returns the client-local ID.
    pub fn share_object(
        &self,
        name: &str,
        dictionary: DataType,
        type_id: TypeId,
        initial: Value,
        updated: SharedObjectUpdatedCallback,
    ) -> Result<ObjectId> {
        if !dictionary.is_defined(type_id) {
            bail!("shared object {name:?} declares undefined type {type_id}");
        }
        // Serialization must work now; the send may happen later.
        dictionary.serialize_object(type_id, &initial)?;

        let mut state = self.lock();
        if !state.object_names.insert(name.to_string()) {
            bail!("shared object {name:?} is already registered");
        }
        let client_id = state.allocate_object_id();
        state.objects.insert(
            client_id,
            SharedObjectEntry {
                server_id: None,
                name: name.to_string(),
                dictionary,
                type_id,
                version: 0,
                value: initial,
                dirty: false,
                updated,
            },
        );

        if state.started {
            let entry = &state.objects[&client_id];
            match self.encode_create_object(client_id, entry) {
                Ok(request) => {
                    drop(state);
                    self.send(request);
                }
                Err(e) => warn!(name, error = %e, "could not announce shared object"),
            }
        } else {
            state.startup_objects.push(client_id);
        }
        Ok(client_id)
    }

    fn encode_create_object(
        &self,
        client_id: ObjectId,
        entry: &SharedObjectEntry,
    ) -> Result<MessageBuffer> {
        let bytes = entry.dictionary.serialize_object(entry.type_id, &entry.value)?;
        koinonia::encode_create_object_request(
            self.client_bases()?.client,
            client_id,
            &entry.name,
            &entry.dictionary,
            entry.type_id,
            &bytes,
        )
    }

    /// Replaces the shared object's value and notifies the server.
    pub fn replace_shared_object(&self, client_id: ObjectId, new_value: Value) -> Result<()> {
        let mut state = self.lock();
        let started = state.started;
        let entry = state
            .objects
            .get_mut(&client_id)
            .with_context(|| format!("unknown shared object {client_id}"))?;
        let bytes = entry.dictionary.serialize_object(entry.type_id, &new_value)?;
        entry.value = new_value;

        match entry.server_id {
            Some(server_id) if started => {
                let request = koinonia::encode_replace_object_request(
                    self.client_bases()?.client,
                    server_id,
                    &entry.dictionary,
                    entry.type_id,
                    &bytes,
                );
                drop(state);
                self.send(request);
            }
            _ => {
                entry.dirty = true;
            }
        }
        Ok(())
    }

    /// Current local value of a shared object.
    pub fn shared_object_value(&self, client_id: ObjectId) -> Option<Value> {
        self.lock().objects.get(&client_id).map(|e| e.value.clone())
    }

    /// Last version the server confirmed for a shared object.
    pub fn shared_object_version(&self, client_id: ObjectId) -> Option<VersionNumber> {
        self.lock().objects.get(&client_id).map(|e| e.version)
    }

    /// True once the server assigned the object its server-side ID.
    pub fn shared_object_synced(&self, client_id: ObjectId) -> bool {
        self.lock()
            .objects
            .get(&client_id)
            .is_some_and(|e| e.server_id.is_some())
    }

    /* Namespaces of dynamic objects. */

    /// Shares a namespace of dynamically created objects. Returns the
    /// client-local namespace ID.
    pub fn share_namespace(
        &self,
        name: &str,
        dictionary: DataType,
        callbacks: NamespaceCallbacks,
    ) -> Result<NamespaceId> {
        let mut state = self.lock();
        if !state.namespace_names.insert(name.to_string()) {
            bail!("namespace {name:?} is already registered");
        }
        let client_id = state.allocate_namespace_id();
        state.namespaces.insert(
            client_id,
            NamespaceEntry {
                server_id: None,
                name: name.to_string(),
                dictionary,
                callbacks,
                last_object_id: 0,
                objects: HashMap::new(),
                server_objects: HashMap::new(),
                pending_creates: Vec::new(),
            },
        );

        if state.started {
            let entry = &state.namespaces[&client_id];
            match koinonia::encode_create_namespace_request(
                self.client_bases()?.client,
                client_id,
                name,
                &entry.dictionary,
            ) {
                Ok(request) => {
                    drop(state);
                    self.send(request);
                }
                Err(e) => warn!(name, error = %e, "could not announce namespace"),
            }
        } else {
            state.startup_namespaces.push(client_id);
        }
        Ok(client_id)
    }

    /// Creates a new object in a namespace. Returns the client-local
    /// object ID; the server-side ID arrives with the reply.
    pub fn create_ns_object(
        &self,
        namespace_id: NamespaceId,
        type_id: TypeId,
        value: Value,
    ) -> Result<ObjectId> {
        let mut state = self.lock();
        let started = state.started;
        let namespace = state
            .namespaces
            .get_mut(&namespace_id)
            .with_context(|| format!("unknown namespace {namespace_id}"))?;
        if !namespace.dictionary.is_defined(type_id) {
            bail!("namespace object declares undefined type {type_id}");
        }
        let bytes = namespace.dictionary.serialize_object(type_id, &value)?;
        let object_id = namespace.allocate_object_id();
        namespace.objects.insert(
            object_id,
            NsObjectEntry {
                server_id: None,
                type_id,
                version: 0,
                value,
                pending: Vec::new(),
                doomed: false,
            },
        );

        match namespace.server_id {
            Some(server_ns) if started => {
                let request = koinonia::encode_create_ns_object_request(
                    self.client_bases()?.client,
                    server_ns,
                    object_id,
                    &namespace.dictionary,
                    type_id,
                    &bytes,
                );
                drop(state);
                self.send(request);
            }
            _ => namespace.pending_creates.push(object_id),
        }
        Ok(object_id)
    }

    /// Replaces a namespace object's value and notifies the server.
    pub fn replace_ns_object(
        &self,
        namespace_id: NamespaceId,
        object_id: ObjectId,
        new_value: Value,
    ) -> Result<()> {
        let mut state = self.lock();
        let started = state.started;
        let namespace = state
            .namespaces
            .get_mut(&namespace_id)
            .with_context(|| format!("unknown namespace {namespace_id}"))?;
        let server_ns = namespace.server_id;
        let dictionary = namespace.dictionary.clone();
        let object = namespace
            .objects
            .get_mut(&object_id)
            .with_context(|| format!("unknown namespace object {object_id}"))?;
        if object.doomed {
            bail!("namespace object {object_id} was destroyed");
        }
        let bytes = dictionary.serialize_object(object.type_id, &new_value)?;
        object.value = new_value;

        match (server_ns, object.server_id) {
            (Some(server_ns), Some(server_obj)) if started => {
                let request = koinonia::encode_replace_ns_object_request(
                    self.client_bases()?.client,
                    server_ns,
                    server_obj,
                    &dictionary,
                    object.type_id,
                    &bytes,
                );
                drop(state);
                self.send(request);
            }
            _ => object.pending.push(NsOp::Replace),
        }
        Ok(())
    }

    /// Destroys a namespace object; the destroyed callback fires locally
    /// right away with the final value.
    pub fn destroy_ns_object(&self, namespace_id: NamespaceId, object_id: ObjectId) -> Result<()> {
        let mut state = self.lock();
        let started = state.started;
        let namespace = state
            .namespaces
            .get_mut(&namespace_id)
            .with_context(|| format!("unknown namespace {namespace_id}"))?;
        let server_ns = namespace.server_id;
        let object = namespace
            .objects
            .get_mut(&object_id)
            .with_context(|| format!("unknown namespace object {object_id}"))?;
        if object.doomed {
            return Ok(());
        }

        let request = match (server_ns, object.server_id) {
            (Some(server_ns), Some(server_obj)) if started => {
                let object = namespace.objects.remove(&object_id).expect("checked");
                namespace.server_objects.remove(&server_obj);
                let request = koinonia::encode_destroy_ns_object_request(
                    self.client_bases()?.client,
                    server_ns,
                    server_obj,
                );
                drop(state);
                self.fire_destroyed(namespace_id, object_id, object.value);
                Some(request)
            }
            _ => {
                // The server has not confirmed the object (or namespace)
                // yet; keep a tombstone until the destroy can go out.
                object.doomed = true;
                object.pending.push(NsOp::Destroy);
                let value = object.value.clone();
                drop(state);
                self.fire_destroyed(namespace_id, object_id, value);
                None
            }
        };
        if let Some(request) = request {
            self.send(request);
        }
        Ok(())
    }

    fn fire_destroyed(&self, namespace_id: NamespaceId, object_id: ObjectId, value: Value) {
        let callback = {
            let state = self.lock();
            state
                .namespaces
                .get(&namespace_id)
                .map(|ns| ns.callbacks.destroyed.clone())
        };
        if let Some(callback) = callback {
            callback(namespace_id, object_id, value);
        }
    }

    /// True once the server assigned the namespace object its server-side
    /// ID.
    pub fn ns_object_synced(&self, namespace_id: NamespaceId, object_id: ObjectId) -> bool {
        self.lock()
            .namespaces
            .get(&namespace_id)
            .and_then(|ns| ns.objects.get(&object_id))
            .is_some_and(|o| o.server_id.is_some())
    }

    /// Current local value of a namespace object.
    pub fn ns_object_value(&self, namespace_id: NamespaceId, object_id: ObjectId) -> Option<Value> {
        self.lock()
            .namespaces
            .get(&namespace_id)?
            .objects
            .get(&object_id)
            .map(|o| o.value.clone())
    }

    /// Client-local IDs of the live objects in a namespace.
    pub fn ns_objects(&self, namespace_id: NamespaceId) -> Vec<ObjectId> {
        self.lock()
            .namespaces
            .get(&namespace_id)
            .map(|ns| {
                let mut ids: Vec<ObjectId> = ns
                    .objects
                    .iter()
                    .filter(|(_, o)| !o.doomed)
                    .map(|(&id, _)| id)
                    .collect();
                ids.sort_unstable();
                ids
            })
            .unwrap_or_default()
    }
}

impl KoinoniaClient {
    /* Back-end message handlers. */

    async fn handle_create_object_reply(
        &self,
        handle: &ClientHandle,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let client_id = reader.read_u16().await?;
        let server_id = reader.read_u16().await?;
        let version = reader.read_u32().await?;
        let existed = reader.read_bool().await?;

        let captured = if existed {
            let (dictionary, type_id) = {
                let state = self.lock();
                let entry = state
                    .objects
                    .get(&client_id)
                    .with_context(|| format!("reply for unknown shared object {client_id}"))?;
                (entry.dictionary.clone(), entry.type_id)
            };
            let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
            Some(dictionary.normalize_object_bytes(type_id, bytes, handle.swap_on_read())?)
        } else {
            None
        };

        let bases = self.client_bases()?;
        let mut replay = None;
        {
            let mut state = self.lock();
            let entry = state
                .objects
                .get_mut(&client_id)
                .with_context(|| format!("reply for unknown shared object {client_id}"))?;
            entry.server_id = Some(server_id);
            entry.version = version;
            if entry.dirty {
                entry.dirty = false;
                if existed {
                    // The stored value won; our buffered replace is stale.
                    debug!(object = %entry.name, "dropping replace superseded by server value");
                } else {
                    let bytes = entry.dictionary.serialize_object(entry.type_id, &entry.value)?;
                    replay = Some(koinonia::encode_replace_object_request(
                        bases.client,
                        server_id,
                        &entry.dictionary,
                        entry.type_id,
                        &bytes,
                    ));
                }
            }
            let forward = captured.as_ref().map(|bytes| {
                koinonia::encode_create_object_reply(
                    bases.server,
                    client_id,
                    server_id,
                    version,
                    Some((&entry.dictionary, entry.type_id, bytes.as_slice())),
                )
            });
            state.server_objects.insert(server_id, client_id);
            if let Some(forward) = forward {
                handle.forward_frontend(self.plugin_index, CREATE_OBJECT_REPLY, forward);
            }
        }
        if let Some(request) = replay {
            self.send(request);
        }
        Ok(())
    }

    async fn handle_replace_object_notification(
        &self,
        handle: &ClientHandle,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let server_id = reader.read_u16().await?;
        let version = reader.read_u32().await?;
        let (dictionary, type_id) = {
            let mut state = self.lock();
            let (_, entry) = state.object_by_server_id(server_id)?;
            (entry.dictionary.clone(), entry.type_id)
        };
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes = dictionary.normalize_object_bytes(type_id, bytes, handle.swap_on_read())?;

        let bases = self.client_bases()?;
        let mut state = self.lock();
        let (_, entry) = state.object_by_server_id(server_id)?;
        entry.version = version;
        let forward = koinonia::encode_replace_object_notification(
            bases.server,
            server_id,
            version,
            &dictionary,
            type_id,
            &bytes,
        );
        handle.forward_frontend(self.plugin_index, REPLACE_OBJECT_NOTIFICATION, forward);
        Ok(())
    }

    async fn handle_create_namespace_reply(&self, reader: &mut ReliableReader) -> Result<()> {
        let client_id = reader.read_u16().await?;
        let server_id = reader.read_u16().await?;

        let bases = self.client_bases()?;
        let mut requests = Vec::new();
        {
            let mut state = self.lock();
            let namespace = state
                .namespaces
                .get_mut(&client_id)
                .with_context(|| format!("reply for unknown namespace {client_id}"))?;
            namespace.server_id = Some(server_id);

            // Flush the creates queued while the server ID was unknown.
            for object_id in std::mem::take(&mut namespace.pending_creates) {
                let Some(object) = namespace.objects.get(&object_id) else {
                    continue;
                };
                if object.doomed {
                    namespace.objects.remove(&object_id);
                    continue;
                }
                let bytes = namespace
                    .dictionary
                    .serialize_object(object.type_id, &object.value)?;
                requests.push(koinonia::encode_create_ns_object_request(
                    bases.client,
                    server_id,
                    object_id,
                    &namespace.dictionary,
                    object.type_id,
                    &bytes,
                ));
            }
            state.server_namespaces.insert(server_id, client_id);
        }
        for request in requests {
            self.send(request);
        }
        Ok(())
    }

    async fn handle_create_ns_object_reply(&self, reader: &mut ReliableReader) -> Result<()> {
        let server_ns = reader.read_u16().await?;
        let client_obj = reader.read_u16().await?;
        let server_obj = reader.read_u16().await?;

        let bases = self.client_bases()?;
        let mut requests = Vec::new();
        {
            let mut state = self.lock();
            let (_, namespace) = state.namespace_by_server_id(server_ns)?;
            let dictionary = namespace.dictionary.clone();
            let object = namespace
                .objects
                .get_mut(&client_obj)
                .with_context(|| format!("reply for unknown namespace object {client_obj}"))?;
            object.server_id = Some(server_obj);

            let mut destroy = false;
            for op in std::mem::take(&mut object.pending) {
                match op {
                    NsOp::Replace => {
                        let bytes = dictionary.serialize_object(object.type_id, &object.value)?;
                        requests.push(koinonia::encode_replace_ns_object_request(
                            bases.client,
                            server_ns,
                            server_obj,
                            &dictionary,
                            object.type_id,
                            &bytes,
                        ));
                    }
                    NsOp::Destroy => destroy = true,
                }
            }
            if destroy {
                requests.push(koinonia::encode_destroy_ns_object_request(
                    bases.client,
                    server_ns,
                    server_obj,
                ));
                namespace.objects.remove(&client_obj);
            } else {
                namespace.server_objects.insert(server_obj, client_obj);
            }
        }
        for request in requests {
            self.send(request);
        }
        Ok(())
    }

    async fn handle_create_ns_object_notification(
        &self,
        handle: &ClientHandle,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let server_ns = reader.read_u16().await?;
        let server_obj = reader.read_u16().await?;
        let version = reader.read_u32().await?;
        let type_id = reader.read_u8().await?;

        let dictionary = {
            let mut state = self.lock();
            let (_, namespace) = state.namespace_by_server_id(server_ns)?;
            if !namespace.dictionary.is_defined(type_id) {
                bail!("namespace object notification declares undefined type {type_id}");
            }
            namespace.dictionary.clone()
        };
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes = dictionary.normalize_object_bytes(type_id, bytes, handle.swap_on_read())?;

        let bases = self.client_bases()?;
        let mut state = self.lock();
        let (_, namespace) = state.namespace_by_server_id(server_ns)?;
        let object_id = namespace.allocate_object_id();
        namespace.objects.insert(
            object_id,
            NsObjectEntry {
                server_id: Some(server_obj),
                type_id,
                version,
                value: dictionary.create_object(type_id)?,
                pending: Vec::new(),
                doomed: false,
            },
        );
        namespace.server_objects.insert(server_obj, object_id);

        let forward = koinonia::encode_create_ns_object_notification(
            bases.server,
            server_ns,
            server_obj,
            version,
            &dictionary,
            type_id,
            &bytes,
        );
        handle.forward_frontend(self.plugin_index, CREATE_NS_OBJECT_NOTIFICATION, forward);
        Ok(())
    }

    async fn handle_replace_ns_object_notification(
        &self,
        handle: &ClientHandle,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let server_ns = reader.read_u16().await?;
        let server_obj = reader.read_u16().await?;
        let version = reader.read_u32().await?;

        let (dictionary, type_id) = {
            let mut state = self.lock();
            let (_, namespace) = state.namespace_by_server_id(server_ns)?;
            let client_obj = *namespace
                .server_objects
                .get(&server_obj)
                .with_context(|| format!("notification for unknown namespace object {server_obj}"))?;
            let object = &namespace.objects[&client_obj];
            (namespace.dictionary.clone(), object.type_id)
        };
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes = dictionary.normalize_object_bytes(type_id, bytes, handle.swap_on_read())?;

        let bases = self.client_bases()?;
        let mut state = self.lock();
        let (_, namespace) = state.namespace_by_server_id(server_ns)?;
        if let Some(client_obj) = namespace.server_objects.get(&server_obj).copied() {
            if let Some(object) = namespace.objects.get_mut(&client_obj) {
                object.version = version;
            }
        }
        let forward = koinonia::encode_replace_ns_object_notification(
            bases.server,
            server_ns,
            server_obj,
            version,
            &dictionary,
            type_id,
            &bytes,
        );
        handle.forward_frontend(self.plugin_index, REPLACE_NS_OBJECT_NOTIFICATION, forward);
        Ok(())
    }

    /* Front-end handlers: materialize values and fire callbacks. */

    fn frontend_create_object_reply(&self, message: &MessageBuffer) -> Result<()> {
        let mut reader = message.payload_reader(false);
        let client_id = reader.read_u16()?;
        let _server_id = reader.read_u16()?;
        let _version = reader.read_u32()?;
        if !reader.read_bool()? {
            return Ok(());
        }

        let (value, callback_value) = {
            let mut state = self.lock();
            let entry = state
                .objects
                .get_mut(&client_id)
                .with_context(|| format!("forwarded reply for unknown object {client_id}"))?;
            let bytes = entry.dictionary.read_sized_bytes(entry.type_id, &mut reader)?;
            let mut object_reader = MessageReader::new(bytes, false);
            let value = entry.dictionary.read_object(entry.type_id, &mut object_reader)?;
            entry.value = value.clone();
            (value, client_id)
        };
        self.fire_updated(callback_value, &value);
        Ok(())
    }

    fn frontend_replace_object_notification(&self, message: &MessageBuffer) -> Result<()> {
        let mut reader = message.payload_reader(false);
        let server_id = reader.read_u16()?;
        let _version = reader.read_u32()?;

        let (client_id, value) = {
            let mut state = self.lock();
            let (client_id, entry) = state.object_by_server_id(server_id)?;
            let bytes = entry.dictionary.read_sized_bytes(entry.type_id, &mut reader)?;
            let mut object_reader = MessageReader::new(bytes, false);
            let value = entry.dictionary.read_object(entry.type_id, &mut object_reader)?;
            entry.value = value.clone();
            (client_id, value)
        };
        self.fire_updated(client_id, &value);
        Ok(())
    }

    fn fire_updated(&self, client_id: ObjectId, value: &Value) {
        let callback = {
            let state = self.lock();
            state.objects.get(&client_id).map(|e| e.updated.clone())
        };
        if let Some(callback) = callback {
            callback(client_id, value);
        }
    }

    fn frontend_create_ns_object_notification(&self, message: &MessageBuffer) -> Result<()> {
        let mut reader = message.payload_reader(false);
        let server_ns = reader.read_u16()?;
        let server_obj = reader.read_u16()?;
        let version = reader.read_u32()?;
        let type_id = reader.read_u8()?;

        let mut state = self.lock();
        let (namespace_id, namespace) = state.namespace_by_server_id(server_ns)?;
        let client_obj = *namespace
            .server_objects
            .get(&server_obj)
            .with_context(|| format!("forwarded create for unknown object {server_obj}"))?;
        let bytes = namespace.dictionary.read_sized_bytes(type_id, &mut reader)?;
        let mut object_reader = MessageReader::new(bytes, false);
        let value = namespace.dictionary.read_object(type_id, &mut object_reader)?;
        if let Some(object) = namespace.objects.get_mut(&client_obj) {
            object.version = version;
            object.value = value.clone();
        }
        let create_object = namespace.callbacks.create_object.clone();
        let created = namespace.callbacks.created.clone();
        drop(state);

        create_object(namespace_id, client_obj, type_id);
        created(namespace_id, client_obj, &value);
        Ok(())
    }

    fn frontend_replace_ns_object_notification(&self, message: &MessageBuffer) -> Result<()> {
        let mut reader = message.payload_reader(false);
        let server_ns = reader.read_u16()?;
        let server_obj = reader.read_u16()?;
        let version = reader.read_u32()?;

        let mut state = self.lock();
        let (namespace_id, namespace) = state.namespace_by_server_id(server_ns)?;
        let Some(client_obj) = namespace.server_objects.get(&server_obj).copied() else {
            return Ok(());
        };
        let Some(object) = namespace.objects.get(&client_obj) else {
            return Ok(());
        };
        if object.doomed {
            return Ok(());
        }
        let type_id = object.type_id;
        let bytes = namespace.dictionary.read_sized_bytes(type_id, &mut reader)?;
        let mut object_reader = MessageReader::new(bytes, false);
        let value = namespace.dictionary.read_object(type_id, &mut object_reader)?;
        if let Some(object) = namespace.objects.get_mut(&client_obj) {
            object.version = version;
            object.value = value.clone();
        }
        let callback = namespace.callbacks.replaced.clone();
        drop(state);

        callback(namespace_id, client_obj, version, &value);
        Ok(())
    }

    fn frontend_destroy_ns_object_notification(&self, message: &MessageBuffer) -> Result<()> {
        let mut reader = message.payload_reader(false);
        let server_ns = reader.read_u16()?;
        let server_obj = reader.read_u16()?;

        let mut state = self.lock();
        let (namespace_id, namespace) = state.namespace_by_server_id(server_ns)?;
        let Some(client_obj) = namespace.server_objects.remove(&server_obj) else {
            return Ok(());
        };
        let Some(object) = namespace.objects.remove(&client_obj) else {
            return Ok(());
        };
        let callback = namespace.callbacks.destroyed.clone();
        drop(state);

        callback(namespace_id, client_obj, object.value);
        Ok(())
    }
}

#[async_trait]
impl PluginClient for KoinoniaClient {
    fn name(&self) -> &'static str {
        KOINONIA_PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        KOINONIA_PROTOCOL_VERSION
    }

    fn num_client_messages(&self) -> MessageId {
        NUM_CLIENT_MESSAGES
    }

    fn num_server_messages(&self) -> MessageId {
        NUM_SERVER_MESSAGES
    }

    fn set_message_bases(&self, bases: MessageBases) {
        *self.bases.lock().expect("bases lock") = Some(bases);
    }

    fn message_bases(&self) -> Option<MessageBases> {
        *self.bases.lock().expect("bases lock")
    }

    /// Flushes everything shared before the client joined.
    fn start(&self, handle: &ClientHandle) {
        *self.handle.lock().expect("handle lock") = Some(handle.clone());

        let mut requests = Vec::new();
        {
            let mut state = self.lock();
            state.started = true;
            for client_id in std::mem::take(&mut state.startup_objects) {
                let entry = &state.objects[&client_id];
                match self.encode_create_object(client_id, entry) {
                    Ok(request) => requests.push(request),
                    Err(e) => warn!(object = %entry.name, error = %e, "could not announce shared object"),
                }
            }
            for namespace_id in std::mem::take(&mut state.startup_namespaces) {
                let entry = &state.namespaces[&namespace_id];
                match self.client_bases().and_then(|bases| {
                    koinonia::encode_create_namespace_request(
                        bases.client,
                        namespace_id,
                        &entry.name,
                        &entry.dictionary,
                    )
                }) {
                    Ok(request) => requests.push(request),
                    Err(e) => warn!(namespace = %entry.name, error = %e, "could not announce namespace"),
                }
            }
        }
        for request in requests {
            handle.send(request);
        }
    }

    async fn handle_message(
        &self,
        handle: &ClientHandle,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        match offset {
            CREATE_OBJECT_REPLY => self.handle_create_object_reply(handle, reader).await,
            REPLACE_OBJECT_REPLY => {
                let server_id = reader.read_u16().await?;
                let version = reader.read_u32().await?;
                let mut state = self.lock();
                let (_, entry) = state.object_by_server_id(server_id)?;
                entry.version = version;
                Ok(())
            }
            REPLACE_OBJECT_NOTIFICATION => {
                self.handle_replace_object_notification(handle, reader).await
            }
            CREATE_NAMESPACE_REPLY => self.handle_create_namespace_reply(reader).await,
            CREATE_NS_OBJECT_REPLY => self.handle_create_ns_object_reply(reader).await,
            CREATE_NS_OBJECT_NOTIFICATION => {
                self.handle_create_ns_object_notification(handle, reader).await
            }
            REPLACE_NS_OBJECT_REPLY => {
                let server_ns = reader.read_u16().await?;
                let server_obj = reader.read_u16().await?;
                let version = reader.read_u32().await?;
                let mut state = self.lock();
                let (_, namespace) = state.namespace_by_server_id(server_ns)?;
                if let Some(client_obj) = namespace.server_objects.get(&server_obj).copied() {
                    if let Some(object) = namespace.objects.get_mut(&client_obj) {
                        object.version = version;
                    }
                }
                Ok(())
            }
            REPLACE_NS_OBJECT_NOTIFICATION => {
                self.handle_replace_ns_object_notification(handle, reader).await
            }
            DESTROY_NS_OBJECT_NOTIFICATION => {
                let server_ns = reader.read_u16().await?;
                let server_obj = reader.read_u16().await?;
                let bases = self.client_bases()?;
                let forward = koinonia::encode_destroy_ns_object_notification(
                    bases.server,
                    server_ns,
                    server_obj,
                );
                handle.forward_frontend(self.plugin_index, DESTROY_NS_OBJECT_NOTIFICATION, forward);
                Ok(())
            }
            other => bail!("unexpected Koinonia message {other}"),
        }
    }

    fn handle_frontend(
        &self,
        _handle: &ClientHandle,
        offset: MessageId,
        message: &MessageBuffer,
    ) -> Result<()> {
        match offset {
            CREATE_OBJECT_REPLY => self.frontend_create_object_reply(message),
            REPLACE_OBJECT_NOTIFICATION => self.frontend_replace_object_notification(message),
            CREATE_NS_OBJECT_NOTIFICATION => self.frontend_create_ns_object_notification(message),
            REPLACE_NS_OBJECT_NOTIFICATION => self.frontend_replace_ns_object_notification(message),
            DESTROY_NS_OBJECT_NOTIFICATION => self.frontend_destroy_ns_object_notification(message),
            other => bail!("unexpected forwarded Koinonia message {other}"),
        }
    }
}
