//! Server half of the Koinonia shared-object plug-in.
//!
//! The server is the sole source of object versions and server-side IDs.
//! Object payloads are stored as serialized byte blocks in the server's
//! byte order, validated on every replacement; they are never materialized
//! here. Everything a request changes (version counter, stored payload,
//! notification fan-out) happens under one state lock, which is what gives
//! subscribers per-object version-ordered delivery.
//!
//! For a name registered twice, the stored value wins: the later
//! subscriber receives the current serialization and its own submission is
//! discarded. A re-registration with a different type dictionary is a
//! protocol error and costs the offender its connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use collab_shared::buffer::MessageReader;
use collab_shared::console::Console;
use collab_shared::datatype::{DataType, TypeId};
use collab_shared::koinonia::{
    self, NamespaceId, ObjectId, VersionNumber, CREATE_NAMESPACE_REQUEST, CREATE_NS_OBJECT_REQUEST,
    CREATE_OBJECT_REQUEST, DESTROY_NS_OBJECT_REQUEST, KOINONIA_PROTOCOL_NAME,
    KOINONIA_PROTOCOL_VERSION, NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
    REPLACE_NS_OBJECT_REQUEST, REPLACE_OBJECT_REQUEST,
};
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::plugins::PluginServer;
use crate::server::ServerHandle;

/// A globally named static object.
struct SharedObject {
    name: String,
    dictionary: DataType,
    type_id: TypeId,
    version: VersionNumber,
    /// Bare serialization in the server's byte order.
    object: Vec<u8>,
    clients: Vec<ClientId>,
}

/// A dynamic object inside a namespace.
struct NsObject {
    type_id: TypeId,
    version: VersionNumber,
    object: Vec<u8>,
}

/// A shared namespace of dynamic objects.
struct Namespace {
    name: String,
    dictionary: DataType,
    last_object_id: ObjectId,
    objects: HashMap<ObjectId, NsObject>,
    clients: Vec<ClientId>,
}

impl Namespace {
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
struct KoinoniaState {
    last_object_id: ObjectId,
    objects: HashMap<ObjectId, SharedObject>,
    object_names: HashMap<String, ObjectId>,
    last_namespace_id: NamespaceId,
    namespaces: HashMap<NamespaceId, Namespace>,
    namespace_names: HashMap<String, NamespaceId>,
}

impl KoinoniaState {
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
}

pub struct KoinoniaServer {
    bases: Mutex<MessageBases>,
    state: Mutex<KoinoniaState>,
}

impl KoinoniaServer {
    pub fn new() -> Self {
        KoinoniaServer {
            bases: Mutex::new(MessageBases { client: 0, server: 0 }),
            state: Mutex::new(KoinoniaState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KoinoniaState> {
        self.state.lock().expect("koinonia state lock poisoned")
    }
}

impl Default for KoinoniaServer {
    fn default() -> Self {
        Self::new()
    }
}

impl KoinoniaServer {
    fn server_base(&self) -> MessageId {
        self.bases.lock().expect("bases lock").server
    }

    async fn handle_create_object(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let client_object_id = reader.read_u16().await?;
        let name = koinonia::read_string_socket(reader).await?;
        let dictionary = DataType::read_dictionary_socket(reader).await?;
        let type_id = reader.read_u8().await?;
        if !dictionary.is_defined(type_id) {
            bail!("shared object {name:?} declares undefined type {type_id}");
        }
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes =
            dictionary.normalize_object_bytes(type_id, bytes, handle.client_swap(client))?;
        let server_base = self.server_base();

        let mut state = self.lock();
        if let Some(&id) = state.object_names.get(&name) {
            let object = state.objects.get_mut(&id).expect("name map in sync");
            if object.dictionary != dictionary || object.type_id != type_id {
                bail!("shared object {name:?} re-registered with a different type");
            }
            if !object.clients.contains(&client) {
                object.clients.push(client);
            }
            // Stored value wins; ship it back to the new subscriber.
            let reply = koinonia::encode_create_object_reply(
                server_base,
                client_object_id,
                id,
                object.version,
                Some((&object.dictionary, object.type_id, &object.object)),
            );
            handle.send_to(client, reply);
        } else {
            let id = state.allocate_object_id();
            state.objects.insert(
                id,
                SharedObject {
                    name: name.clone(),
                    dictionary,
                    type_id,
                    version: 0,
                    object: bytes,
                    clients: vec![client],
                },
            );
            state.object_names.insert(name.clone(), id);
            let reply =
                koinonia::encode_create_object_reply(server_base, client_object_id, id, 0, None);
            handle.send_to(client, reply);
            info!(object = %name, id, client, "shared object created");
        }
        Ok(())
    }

    async fn handle_replace_object(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let id = reader.read_u16().await?;
        let (dictionary, type_id) = {
            let state = self.lock();
            let object = state
                .objects
                .get(&id)
                .with_context(|| format!("replace of unknown shared object {id}"))?;
            if !object.clients.contains(&client) {
                bail!("replace of shared object {id} by a non-subscriber");
            }
            (object.dictionary.clone(), object.type_id)
        };
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes =
            dictionary.normalize_object_bytes(type_id, bytes, handle.client_swap(client))?;
        let server_base = self.server_base();

        // Version bump and fan-out under one acquisition: subscribers see
        // replacements in version order. The object may have been deleted
        // from the console between the two acquisitions.
        let mut state = self.lock();
        let Some(object) = state.objects.get_mut(&id) else {
            return Ok(());
        };
        object.version += 1;
        object.object = bytes;
        let reply = koinonia::encode_replace_object_reply(server_base, id, object.version);
        let notification = koinonia::encode_replace_object_notification(
            server_base,
            id,
            object.version,
            &object.dictionary,
            object.type_id,
            &object.object,
        );
        let subscribers = object.clients.clone();
        handle.send_to(client, reply);
        for peer in subscribers {
            if peer != client {
                handle.send_to(peer, notification.clone());
            }
        }
        Ok(())
    }

    async fn handle_create_namespace(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let client_namespace_id = reader.read_u16().await?;
        let name = koinonia::read_string_socket(reader).await?;
        let dictionary = DataType::read_dictionary_socket(reader).await?;
        let server_base = self.server_base();

        let mut state = self.lock();
        if let Some(&id) = state.namespace_names.get(&name) {
            let namespace = state.namespaces.get_mut(&id).expect("name map in sync");
            if namespace.dictionary != dictionary {
                bail!("namespace {name:?} re-registered with a different dictionary");
            }
            if !namespace.clients.contains(&client) {
                namespace.clients.push(client);
            }
            let reply =
                koinonia::encode_create_namespace_reply(server_base, client_namespace_id, id);
            handle.send_to(client, reply);

            // Catch the new subscriber up on every current object.
            let mut ids: Vec<ObjectId> = namespace.objects.keys().copied().collect();
            ids.sort_unstable();
            for object_id in ids {
                let object = &namespace.objects[&object_id];
                let notification = koinonia::encode_create_ns_object_notification(
                    server_base,
                    id,
                    object_id,
                    object.version,
                    &namespace.dictionary,
                    object.type_id,
                    &object.object,
                );
                handle.send_to(client, notification);
            }
        } else {
            let id = state.allocate_namespace_id();
            state.namespaces.insert(
                id,
                Namespace {
                    name: name.clone(),
                    dictionary,
                    last_object_id: 0,
                    objects: HashMap::new(),
                    clients: vec![client],
                },
            );
            state.namespace_names.insert(name.clone(), id);
            let reply =
                koinonia::encode_create_namespace_reply(server_base, client_namespace_id, id);
            handle.send_to(client, reply);
            info!(namespace = %name, id, client, "namespace created");
        }
        Ok(())
    }

    async fn handle_create_ns_object(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let namespace_id = reader.read_u16().await?;
        let client_object_id = reader.read_u16().await?;
        let type_id = reader.read_u8().await?;
        let dictionary = {
            let state = self.lock();
            let namespace = state
                .namespaces
                .get(&namespace_id)
                .with_context(|| format!("object created in unknown namespace {namespace_id}"))?;
            if !namespace.clients.contains(&client) {
                bail!("object created in namespace {namespace_id} by a non-subscriber");
            }
            if !namespace.dictionary.is_defined(type_id) {
                bail!("namespace object declares undefined type {type_id}");
            }
            namespace.dictionary.clone()
        };
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes =
            dictionary.normalize_object_bytes(type_id, bytes, handle.client_swap(client))?;
        let server_base = self.server_base();

        let mut state = self.lock();
        let Some(namespace) = state.namespaces.get_mut(&namespace_id) else {
            return Ok(());
        };
        let object_id = namespace.allocate_object_id();
        namespace.objects.insert(
            object_id,
            NsObject {
                type_id,
                version: 0,
                object: bytes,
            },
        );
        let reply = koinonia::encode_create_ns_object_reply(
            server_base,
            namespace_id,
            client_object_id,
            object_id,
        );
        let object = &namespace.objects[&object_id];
        let notification = koinonia::encode_create_ns_object_notification(
            server_base,
            namespace_id,
            object_id,
            0,
            &namespace.dictionary,
            object.type_id,
            &object.object,
        );
        let subscribers = namespace.clients.clone();
        handle.send_to(client, reply);
        for peer in subscribers {
            if peer != client {
                handle.send_to(peer, notification.clone());
            }
        }
        Ok(())
    }

    async fn handle_replace_ns_object(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let namespace_id = reader.read_u16().await?;
        let object_id = reader.read_u16().await?;
        let (dictionary, type_id) = {
            let state = self.lock();
            let namespace = state
                .namespaces
                .get(&namespace_id)
                .with_context(|| format!("replace in unknown namespace {namespace_id}"))?;
            if !namespace.clients.contains(&client) {
                bail!("replace in namespace {namespace_id} by a non-subscriber");
            }
            let object = namespace
                .objects
                .get(&object_id)
                .with_context(|| format!("replace of unknown namespace object {object_id}"))?;
            (namespace.dictionary.clone(), object.type_id)
        };
        let bytes = dictionary.read_object_bytes_socket(type_id, reader).await?;
        let bytes =
            dictionary.normalize_object_bytes(type_id, bytes, handle.client_swap(client))?;
        let server_base = self.server_base();

        let mut state = self.lock();
        let Some(namespace) = state.namespaces.get_mut(&namespace_id) else {
            return Ok(());
        };
        let Some(object) = namespace.objects.get_mut(&object_id) else {
            return Ok(());
        };
        object.version += 1;
        object.object = bytes;
        let reply = koinonia::encode_replace_ns_object_reply(
            server_base,
            namespace_id,
            object_id,
            object.version,
        );
        let notification = koinonia::encode_replace_ns_object_notification(
            server_base,
            namespace_id,
            object_id,
            object.version,
            &namespace.dictionary,
            object.type_id,
            &object.object,
        );
        let subscribers = namespace.clients.clone();
        handle.send_to(client, reply);
        for peer in subscribers {
            if peer != client {
                handle.send_to(peer, notification.clone());
            }
        }
        Ok(())
    }

    async fn handle_destroy_ns_object(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        let namespace_id = reader.read_u16().await?;
        let object_id = reader.read_u16().await?;
        let server_base = self.server_base();

        let mut state = self.lock();
        let namespace = state
            .namespaces
            .get_mut(&namespace_id)
            .with_context(|| format!("destroy in unknown namespace {namespace_id}"))?;
        if !namespace.clients.contains(&client) {
            bail!("destroy in namespace {namespace_id} by a non-subscriber");
        }
        if namespace.objects.remove(&object_id).is_none() {
            bail!("destroy of unknown namespace object {object_id}");
        }
        let notification =
            koinonia::encode_destroy_ns_object_notification(server_base, namespace_id, object_id);
        let subscribers = namespace.clients.clone();
        for peer in subscribers {
            if peer != client {
                handle.send_to(peer, notification.clone());
            }
        }
        Ok(())
    }

    /// Registers the operator commands for object persistence and
    /// introspection.
    pub fn register_console_commands(
        self: Arc<Self>,
        console: &mut Console,
        handle: &ServerHandle,
    ) {
        let plugin = self;
        let handle = handle.clone();
        console.register_command(
            "koinonia",
            "Manage shared objects: list | print | save | load | delete | namespaces | nsobjects | savens",
            move |args, out| plugin.console_command(&handle, args, out),
        );
    }

    fn console_command(
        &self,
        handle: &ServerHandle,
        args: &[&str],
        out: &mut collab_shared::console::ConsoleOutput,
    ) -> Result<()> {
        match args {
            ["list"] => {
                let state = self.lock();
                let mut names: Vec<&String> = state.object_names.keys().collect();
                names.sort();
                for name in names {
                    let id = state.object_names[name];
                    let object = &state.objects[&id];
                    out.print(format!(
                        "  {name:?} id={id} version={} size={} subscribers={}",
                        object.version,
                        object.object.len(),
                        object.clients.len()
                    ));
                }
            }
            ["print", name] => {
                let state = self.lock();
                let object = self.find_object(&state, *name)?.1;
                let mut reader = MessageReader::new(&object.object, false);
                let value = object.dictionary.read_object(object.type_id, &mut reader)?;
                out.print(object.dictionary.format_object(object.type_id, &value));
            }
            ["save", name, file] => {
                let state = self.lock();
                let object = self.find_object(&state, *name)?.1;
                let dump = koinonia::encode_object_file(
                    &object.dictionary,
                    object.type_id,
                    &object.object,
                )?;
                std::fs::write(file, dump).with_context(|| format!("writing {file}"))?;
                out.print(format!("saved {name:?} to {file}"));
            }
            ["load", name, file] => {
                let dump = std::fs::read(file).with_context(|| format!("reading {file}"))?;
                let (dictionary, type_id, bytes) = koinonia::decode_object_file(&dump)?;
                let server_base = self.server_base();

                let mut state = self.lock();
                if let Some(&id) = state.object_names.get(*name) {
                    let object = state.objects.get_mut(&id).expect("name map in sync");
                    if object.dictionary != dictionary || object.type_id != type_id {
                        bail!("dump of {name:?} has a different type than the live object");
                    }
                    object.version += 1;
                    object.object = bytes;
                    let notification = koinonia::encode_replace_object_notification(
                        server_base,
                        id,
                        object.version,
                        &object.dictionary,
                        object.type_id,
                        &object.object,
                    );
                    for &peer in &object.clients {
                        handle.send_to(peer, notification.clone());
                    }
                    out.print(format!("replaced {name:?} at version {}", object.version));
                } else {
                    let id = state.allocate_object_id();
                    state.objects.insert(
                        id,
                        SharedObject {
                            name: name.to_string(),
                            dictionary,
                            type_id,
                            version: 0,
                            object: bytes,
                            clients: Vec::new(),
                        },
                    );
                    state.object_names.insert(name.to_string(), id);
                    out.print(format!("loaded {name:?} as object {id}"));
                }
            }
            ["delete", name] => {
                let mut state = self.lock();
                let id = state
                    .object_names
                    .remove(*name)
                    .with_context(|| format!("no shared object named {name:?}"))?;
                state.objects.remove(&id);
                out.print(format!("deleted {name:?}"));
            }
            ["namespaces"] => {
                let state = self.lock();
                let mut names: Vec<&String> = state.namespace_names.keys().collect();
                names.sort();
                for name in names {
                    let id = state.namespace_names[name];
                    let namespace = &state.namespaces[&id];
                    out.print(format!(
                        "  {name:?} id={id} objects={} subscribers={}",
                        namespace.objects.len(),
                        namespace.clients.len()
                    ));
                }
            }
            ["nsobjects", name] => {
                let state = self.lock();
                let namespace = self.find_namespace(&state, *name)?;
                let mut ids: Vec<&ObjectId> = namespace.objects.keys().collect();
                ids.sort();
                for id in ids {
                    let object = &namespace.objects[id];
                    out.print(format!(
                        "  {id} type={} version={} size={}",
                        object.type_id,
                        object.version,
                        object.object.len()
                    ));
                }
            }
            ["savens", name, file] => {
                let state = self.lock();
                let namespace = self.find_namespace(&state, *name)?;
                let mut ids: Vec<ObjectId> = namespace.objects.keys().copied().collect();
                ids.sort_unstable();
                let objects: Vec<(ObjectId, TypeId, VersionNumber, &[u8])> = ids
                    .iter()
                    .map(|id| {
                        let object = &namespace.objects[id];
                        (*id, object.type_id, object.version, object.object.as_slice())
                    })
                    .collect();
                let dump = koinonia::encode_namespace_file(&namespace.dictionary, &objects)?;
                std::fs::write(file, dump).with_context(|| format!("writing {file}"))?;
                out.print(format!("saved namespace {name:?} to {file}"));
            }
            _ => {
                out.print(
                    "usage: koinonia list | print <name> | save <name> <file> | \
                     load <name> <file> | delete <name> | namespaces | \
                     nsobjects <name> | savens <name> <file>",
                );
            }
        }
        Ok(())
    }

    fn find_object<'a>(
        &self,
        state: &'a KoinoniaState,
        name: &str,
    ) -> Result<(ObjectId, &'a SharedObject)> {
        let id = *state
            .object_names
            .get(name)
            .with_context(|| format!("no shared object named {name:?}"))?;
        Ok((id, &state.objects[&id]))
    }

    fn find_namespace<'a>(&self, state: &'a KoinoniaState, name: &str) -> Result<&'a Namespace> {
        let id = *state
            .namespace_names
            .get(name)
            .with_context(|| format!("no namespace named {name:?}"))?;
        Ok(&state.namespaces[&id])
    }
}

#[async_trait]
impl PluginServer for KoinoniaServer {
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
        *self.bases.lock().expect("bases lock") = bases;
    }

    fn message_bases(&self) -> MessageBases {
        *self.bases.lock().expect("bases lock")
    }

    fn client_connected(&self, _handle: &ServerHandle, _client: ClientId) {}

    fn client_disconnected(&self, _handle: &ServerHandle, client: ClientId) {
        let mut state = self.lock();
        for object in state.objects.values_mut() {
            object.clients.retain(|&c| c != client);
        }
        for namespace in state.namespaces.values_mut() {
            namespace.clients.retain(|&c| c != client);
        }
    }

    async fn handle_message(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        match offset {
            CREATE_OBJECT_REQUEST => self.handle_create_object(handle, client, reader).await,
            REPLACE_OBJECT_REQUEST => self.handle_replace_object(handle, client, reader).await,
            CREATE_NAMESPACE_REQUEST => self.handle_create_namespace(handle, client, reader).await,
            CREATE_NS_OBJECT_REQUEST => self.handle_create_ns_object(handle, client, reader).await,
            REPLACE_NS_OBJECT_REQUEST => {
                self.handle_replace_ns_object(handle, client, reader).await
            }
            DESTROY_NS_OBJECT_REQUEST => {
                self.handle_destroy_ns_object(handle, client, reader).await
            }
            other => bail!("unexpected Koinonia message {other}"),
        }
    }
}
