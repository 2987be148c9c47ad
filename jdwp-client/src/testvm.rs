// In-process fake VM for tests
//
// Speaks real JDWP bytes over a loopback TCP socket: handshake, the command
// subset this crate sends, and composite method-entry events. Tests
// configure which classes exist, which breakpoint fires, and whether a
// remote System.load throws.

use crate::commands::{
    class_type_commands, command_sets, event_commands, event_kinds, method_commands,
    object_reference_commands, reference_type_commands, stack_frame_commands,
    string_reference_commands, thread_commands, vm_commands,
};
use crate::protocol::{HEADER_SIZE, JDWP_HANDSHAKE};
use crate::reader::{put_string, read_i32, read_string, read_u64, read_u8};
use crate::types::tags;
use bytes::BufMut;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

const MAIN_THREAD_ID: u64 = 1;
const EXCEPTION_OBJECT_ID: u64 = 0xEE00;
const EXCEPTION_CLASS_ID: u64 = 0xEC00;
const CONTEXT_OBJECT_ID: u64 = 0xC0DE;

#[derive(Debug, Clone)]
struct FakeMethod {
    method_id: u64,
    name: String,
    signature: String,
}

#[derive(Debug, Clone)]
struct FakeClass {
    class_id: u64,
    name: String,
    methods: Vec<FakeMethod>,
}

#[derive(Debug, Clone)]
struct FireRule {
    class_name: String,
    method_name: String,
    delay: Duration,
    times: u32,
}

#[derive(Debug, Default)]
struct VmState {
    strings: HashMap<u64, String>,
    objects: HashMap<u64, u64>, // object id -> class id
    next_string_id: u64,
    next_request_id: i32,
    next_object_id: u64,
    armed_requests: Vec<(i32, u64)>, // (request id, class id)
    cleared_requests: Vec<i32>,
    loads: Vec<String>,
    invocations: Vec<(String, String, Vec<String>)>,
    thread_resumes: u32,
    disposed: bool,
}

pub struct FakeVmBuilder {
    classes: Vec<FakeClass>,
    fire: Vec<FireRule>,
    fail_load: Option<String>,
    thread_name: String,
    frame_context_class: Option<String>,
    next_class_id: u64,
    next_method_id: u64,
}

impl Default for FakeVmBuilder {
    fn default() -> Self {
        let mut builder = Self {
            classes: Vec::new(),
            fire: Vec::new(),
            fail_load: None,
            thread_name: "main".to_string(),
            frame_context_class: None,
            next_class_id: 0x1000,
            next_method_id: 0x2000,
        };
        builder = builder.class(
            "java.lang.System",
            &[
                ("load", "(Ljava/lang/String;)V"),
                ("echo", "(Ljava/lang/String;)Ljava/lang/String;"),
            ],
        );
        builder
    }
}

impl FakeVmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a loaded class with its (name, signature) methods.
    pub fn class(mut self, name: &str, methods: &[(&str, &str)]) -> Self {
        let class_id = self.next_class_id;
        self.next_class_id += 0x10;
        let methods = methods
            .iter()
            .map(|(name, signature)| {
                let method_id = self.next_method_id;
                self.next_method_id += 1;
                FakeMethod {
                    method_id,
                    name: name.to_string(),
                    signature: signature.to_string(),
                }
            })
            .collect();
        self.classes.push(FakeClass {
            class_id,
            name: name.to_string(),
            methods,
        });
        self
    }

    /// Fire a method-entry event `times` times, `delay` after the matching
    /// event request is set.
    pub fn fire_on(mut self, class_name: &str, method_name: &str, delay: Duration, times: u32) -> Self {
        self.fire.push(FireRule {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            delay,
            times,
        });
        self
    }

    /// Make every remote System.load call throw with this message.
    pub fn fail_load(mut self, message: &str) -> Self {
        self.fail_load = Some(message.to_string());
        self
    }

    pub fn thread_name(mut self, name: &str) -> Self {
        self.thread_name = name.to_string();
        self
    }

    /// Back the stack frame's Context argument with an instance of this
    /// class, so instance calls on it resolve against that class's methods.
    pub fn frame_context_class(mut self, name: &str) -> Self {
        self.frame_context_class = Some(name.to_string());
        self
    }

    pub async fn start(self) -> FakeVm {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake vm");
        let port = listener.local_addr().expect("local addr").port();

        let state = Arc::new(Mutex::new(VmState {
            next_string_id: 0x5000,
            next_request_id: 100,
            next_object_id: 0x9000,
            ..Default::default()
        }));

        if let Some(name) = &self.frame_context_class {
            if let Some(class) = self.classes.iter().find(|c| c.name == *name) {
                state
                    .lock()
                    .unwrap()
                    .objects
                    .insert(CONTEXT_OBJECT_ID, class.class_id);
            }
        }

        let vm = FakeVm {
            port,
            state: state.clone(),
        };

        let config = Arc::new(VmConfig {
            classes: self.classes,
            fire: self.fire,
            fail_load: self.fail_load,
            thread_name: self.thread_name,
        });

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, state, config).await {
                        debug!("fake vm connection ended: {}", e);
                    }
                });
            }
        });

        vm
    }
}

struct VmConfig {
    classes: Vec<FakeClass>,
    fire: Vec<FireRule>,
    fail_load: Option<String>,
    thread_name: String,
}

impl VmConfig {
    fn class_by_name(&self, name: &str) -> Option<&FakeClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    fn class_by_id(&self, id: u64) -> Option<&FakeClass> {
        self.classes.iter().find(|c| c.class_id == id)
    }
}

/// Handle to a running fake VM.
pub struct FakeVm {
    pub port: u16,
    state: Arc<Mutex<VmState>>,
}

impl FakeVm {
    /// Remote paths passed to System.load so far.
    pub fn loads(&self) -> Vec<String> {
        self.state.lock().unwrap().loads.clone()
    }

    /// (class, method, args) for every remote invocation, in call order.
    /// String arguments are resolved to their text, objects render as
    /// `obj@<id>`, null as `null`.
    pub fn invocations(&self) -> Vec<(String, String, Vec<String>)> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn armed_request_ids(&self) -> Vec<i32> {
        self.state
            .lock()
            .unwrap()
            .armed_requests
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn cleared_request_ids(&self) -> Vec<i32> {
        self.state.lock().unwrap().cleared_requests.clone()
    }

    pub fn thread_resumes(&self) -> u32 {
        self.state.lock().unwrap().thread_resumes
    }

    pub fn disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<VmState>>,
    config: Arc<VmConfig>,
) -> std::io::Result<()> {
    // handshake: echo
    let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;
    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;

    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let command_set = header[9];
        let command = header[10];

        let mut data = vec![0u8; length - HEADER_SIZE];
        reader.read_exact(&mut data).await?;

        handle_command(
            id,
            command_set,
            command,
            &data,
            &state,
            &config,
            &writer,
        )
        .await?;
    }
}

async fn handle_command(
    id: u32,
    command_set: u8,
    command: u8,
    data: &[u8],
    state: &Arc<Mutex<VmState>>,
    config: &Arc<VmConfig>,
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
) -> std::io::Result<()> {
    let mut buf = data;
    let mut reply = Vec::new();
    let mut error: u16 = 0;

    match (command_set, command) {
        (command_sets::VIRTUAL_MACHINE, vm_commands::VERSION) => {
            put_string(&mut reply, "Fake ART VM");
            reply.put_i32(1);
            reply.put_i32(8);
            put_string(&mut reply, "2.1.0");
            put_string(&mut reply, "Art");
        }
        (command_sets::VIRTUAL_MACHINE, vm_commands::CLASSES_BY_SIGNATURE) => {
            let signature = read_string(&mut buf).unwrap_or_default();
            let name = crate::types::signature_to_class_name(&signature);
            match config.class_by_name(&name) {
                Some(class) => {
                    reply.put_i32(1);
                    reply.put_u8(1);
                    reply.put_u64(class.class_id);
                    reply.put_i32(7); // verified | prepared | initialized
                }
                None => reply.put_i32(0),
            }
        }
        (command_sets::VIRTUAL_MACHINE, vm_commands::CREATE_STRING) => {
            let value = read_string(&mut buf).unwrap_or_default();
            let mut st = state.lock().unwrap();
            let string_id = st.next_string_id;
            st.next_string_id += 1;
            st.strings.insert(string_id, value);
            reply.put_u64(string_id);
        }
        (command_sets::VIRTUAL_MACHINE, vm_commands::RESUME) => {}
        (command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE) => {
            state.lock().unwrap().disposed = true;
        }
        (command_sets::REFERENCE_TYPE, reference_type_commands::SIGNATURE) => {
            let class_id = read_u64(&mut buf).unwrap_or(0);
            if class_id == EXCEPTION_CLASS_ID {
                put_string(&mut reply, "Ljava/lang/UnsatisfiedLinkError;");
            } else if let Some(class) = config.class_by_id(class_id) {
                put_string(&mut reply, &crate::types::class_signature(&class.name));
            } else {
                error = 21; // INVALID_CLASS
            }
        }
        (command_sets::REFERENCE_TYPE, reference_type_commands::METHODS) => {
            let class_id = read_u64(&mut buf).unwrap_or(0);
            if class_id == EXCEPTION_CLASS_ID {
                reply.put_i32(1);
                reply.put_u64(0xEEAD);
                put_string(&mut reply, "getMessage");
                put_string(&mut reply, "()Ljava/lang/String;");
                reply.put_i32(1);
            } else if let Some(class) = config.class_by_id(class_id) {
                reply.put_i32(class.methods.len() as i32);
                for m in &class.methods {
                    reply.put_u64(m.method_id);
                    put_string(&mut reply, &m.name);
                    put_string(&mut reply, &m.signature);
                    reply.put_i32(1);
                }
            } else {
                error = 21;
            }
        }
        (command_sets::CLASS_TYPE, class_type_commands::INVOKE_METHOD) => {
            let class_id = read_u64(&mut buf).unwrap_or(0);
            let _thread = read_u64(&mut buf).unwrap_or(0);
            let method_id = read_u64(&mut buf).unwrap_or(0);
            let args = read_args(&mut buf);

            let class_name = config
                .class_by_id(class_id)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            let method = config
                .class_by_id(class_id)
                .and_then(|c| c.methods.iter().find(|m| m.method_id == method_id))
                .cloned();

            let mut st = state.lock().unwrap();
            let method_name = method.as_ref().map(|m| m.name.clone()).unwrap_or_default();
            record_call(&mut st, &class_name, &method_name, &args);

            match method_name.as_str() {
                "load" => {
                    let path = args
                        .first()
                        .and_then(|(tag, v)| (*tag == tags::STRING).then_some(*v))
                        .and_then(|sid| st.strings.get(&sid).cloned())
                        .unwrap_or_default();
                    if let Some(message) = &config.fail_load {
                        let message_id = st.next_string_id;
                        st.next_string_id += 1;
                        st.strings.insert(message_id, message.clone());
                        reply.put_u8(tags::VOID);
                        reply.put_u8(tags::OBJECT);
                        reply.put_u64(EXCEPTION_OBJECT_ID);
                    } else {
                        st.loads.push(path);
                        reply.put_u8(tags::VOID);
                        reply.put_u8(tags::OBJECT);
                        reply.put_u64(0);
                    }
                }
                "echo" => {
                    let string_id = args
                        .first()
                        .map(|(_, v)| *v)
                        .unwrap_or_default();
                    reply.put_u8(tags::STRING);
                    reply.put_u64(string_id);
                    reply.put_u8(tags::OBJECT);
                    reply.put_u64(0);
                }
                _ => match &method {
                    Some(method) => put_invoke_result(&mut reply, &mut st, config, &method.signature),
                    None => {
                        reply.put_u8(tags::VOID);
                        reply.put_u8(tags::OBJECT);
                        reply.put_u64(0);
                    }
                },
            }
        }
        (command_sets::CLASS_TYPE, class_type_commands::NEW_INSTANCE) => {
            let class_id = read_u64(&mut buf).unwrap_or(0);
            let _thread = read_u64(&mut buf).unwrap_or(0);
            let _method_id = read_u64(&mut buf).unwrap_or(0);
            let args = read_args(&mut buf);

            let class_name = config
                .class_by_id(class_id)
                .map(|c| c.name.clone())
                .unwrap_or_default();

            let mut st = state.lock().unwrap();
            record_call(&mut st, &class_name, "<init>", &args);
            let object_id = st.next_object_id;
            st.next_object_id += 1;
            st.objects.insert(object_id, class_id);
            reply.put_u8(tags::OBJECT);
            reply.put_u64(object_id);
            reply.put_u8(tags::OBJECT);
            reply.put_u64(0);
        }
        (command_sets::OBJECT_REFERENCE, object_reference_commands::REFERENCE_TYPE) => {
            let object_id = read_u64(&mut buf).unwrap_or(0);
            reply.put_u8(1);
            if object_id == EXCEPTION_OBJECT_ID {
                reply.put_u64(EXCEPTION_CLASS_ID);
            } else {
                let mapped = state.lock().unwrap().objects.get(&object_id).copied();
                reply.put_u64(
                    mapped.unwrap_or_else(|| {
                        config.classes.first().map(|c| c.class_id).unwrap_or(0)
                    }),
                );
            }
        }
        (command_sets::OBJECT_REFERENCE, object_reference_commands::INVOKE_METHOD) => {
            let object_id = read_u64(&mut buf).unwrap_or(0);
            if object_id == EXCEPTION_OBJECT_ID {
                // getMessage: the most recently stored string is the message
                let st = state.lock().unwrap();
                let message_id = st.next_string_id - 1;
                drop(st);
                reply.put_u8(tags::STRING);
                reply.put_u64(message_id);
                reply.put_u8(tags::OBJECT);
                reply.put_u64(0);
            } else {
                let _thread = read_u64(&mut buf).unwrap_or(0);
                let class_id = read_u64(&mut buf).unwrap_or(0);
                let method_id = read_u64(&mut buf).unwrap_or(0);
                let args = read_args(&mut buf);

                let class_name = config
                    .class_by_id(class_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let method = config
                    .class_by_id(class_id)
                    .and_then(|c| c.methods.iter().find(|m| m.method_id == method_id))
                    .cloned();

                let mut st = state.lock().unwrap();
                match &method {
                    Some(method) => {
                        record_call(&mut st, &class_name, &method.name, &args);
                        put_invoke_result(&mut reply, &mut st, config, &method.signature);
                    }
                    None => {
                        reply.put_u8(tags::VOID);
                        reply.put_u8(tags::OBJECT);
                        reply.put_u64(0);
                    }
                }
            }
        }
        (command_sets::STRING_REFERENCE, string_reference_commands::VALUE) => {
            let string_id = read_u64(&mut buf).unwrap_or(0);
            let value = state
                .lock()
                .unwrap()
                .strings
                .get(&string_id)
                .cloned()
                .unwrap_or_default();
            put_string(&mut reply, &value);
        }
        (command_sets::THREAD_REFERENCE, thread_commands::NAME) => {
            put_string(&mut reply, &config.thread_name);
        }
        (command_sets::THREAD_REFERENCE, thread_commands::STATUS) => {
            reply.put_i32(1); // running
            reply.put_i32(1); // suspended
        }
        (command_sets::THREAD_REFERENCE, thread_commands::RESUME) => {
            state.lock().unwrap().thread_resumes += 1;
        }
        (command_sets::EVENT_REQUEST, event_commands::SET) => {
            let kind = read_u8(&mut buf).unwrap_or(0);
            let _suspend_policy = read_u8(&mut buf).unwrap_or(0);
            let modifier_count = read_i32(&mut buf).unwrap_or(0);
            let mut class_id = 0u64;
            if modifier_count > 0 {
                let _modifier_kind = read_u8(&mut buf).unwrap_or(0);
                class_id = read_u64(&mut buf).unwrap_or(0);
            }

            let request_id = {
                let mut st = state.lock().unwrap();
                let request_id = st.next_request_id;
                st.next_request_id += 1;
                st.armed_requests.push((request_id, class_id));
                request_id
            };
            reply.put_i32(request_id);

            if kind == event_kinds::METHOD_ENTRY {
                schedule_fire(config, writer, class_id, request_id);
            }
        }
        (command_sets::EVENT_REQUEST, event_commands::CLEAR) => {
            let _kind = read_u8(&mut buf).unwrap_or(0);
            let request_id = read_i32(&mut buf).unwrap_or(0);
            let mut st = state.lock().unwrap();
            st.cleared_requests.push(request_id);
            st.armed_requests.retain(|(id, _)| *id != request_id);
        }
        (command_sets::METHOD, method_commands::VARIABLE_TABLE) => {
            reply.put_i32(1); // arg count
            reply.put_i32(1); // one variable
            reply.put_u64(0);
            put_string(&mut reply, "base");
            put_string(&mut reply, "Landroid/content/Context;");
            reply.put_u32(100);
            reply.put_u32(1);
        }
        (command_sets::THREAD_REFERENCE, thread_commands::FRAMES) => {
            reply.put_i32(1);
            reply.put_u64(0xF0); // frame id
            reply.put_u8(1);
            reply.put_u64(config.classes.first().map(|c| c.class_id).unwrap_or(0));
            reply.put_u64(0);
            reply.put_u64(0);
        }
        (command_sets::STACK_FRAME, stack_frame_commands::GET_VALUES) => {
            reply.put_i32(1);
            reply.put_u8(tags::OBJECT);
            reply.put_u64(CONTEXT_OBJECT_ID); // the context argument
        }
        (command_sets::STACK_FRAME, stack_frame_commands::THIS_OBJECT) => {
            reply.put_u8(tags::OBJECT);
            reply.put_u64(0xD15);
        }
        _ => {
            error = 99; // NOT_IMPLEMENTED
        }
    }

    send_reply(writer, id, error, &reply).await
}

fn schedule_fire(
    config: &Arc<VmConfig>,
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    class_id: u64,
    request_id: i32,
) {
    let Some(class) = config.class_by_id(class_id) else {
        return;
    };
    let Some(rule) = config.fire.iter().find(|r| r.class_name == class.name) else {
        return;
    };
    let Some(method) = class.methods.iter().find(|m| m.name == rule.method_name) else {
        return;
    };

    let writer = writer.clone();
    let delay = rule.delay;
    let times = rule.times;
    let method_id = method.method_id;
    tokio::spawn(async move {
        for _ in 0..times {
            tokio::time::sleep(delay).await;
            let mut payload = Vec::new();
            payload.put_u8(1); // suspend policy: event thread
            payload.put_i32(1);
            payload.put_u8(event_kinds::METHOD_ENTRY);
            payload.put_i32(request_id);
            payload.put_u64(MAIN_THREAD_ID);
            payload.put_u8(1);
            payload.put_u64(class_id);
            payload.put_u64(method_id);
            payload.put_u64(0);

            if send_event(&writer, &payload).await.is_err() {
                break;
            }
        }
    });
}

async fn send_reply(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    id: u32,
    error: u16,
    data: &[u8],
) -> std::io::Result<()> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + data.len());
    packet.put_u32((HEADER_SIZE + data.len()) as u32);
    packet.put_u32(id);
    packet.put_u8(0x80);
    packet.put_u16(error);
    packet.extend_from_slice(data);

    let mut w = writer.lock().await;
    w.write_all(&packet).await?;
    w.flush().await
}

async fn send_event(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.put_u32((HEADER_SIZE + payload.len()) as u32);
    packet.put_u32(0x8000_0001);
    packet.put_u8(0x00);
    packet.put_u8(64); // composite event command set
    packet.put_u8(100); // composite event command
    packet.extend_from_slice(payload);

    let mut w = writer.lock().await;
    w.write_all(&packet).await?;
    w.flush().await
}

fn record_call(st: &mut VmState, class_name: &str, method_name: &str, args: &[(u8, u64)]) {
    let described = args
        .iter()
        .map(|(tag, value)| match *tag {
            tags::STRING => st.strings.get(value).cloned().unwrap_or_default(),
            tags::BOOLEAN => (*value != 0).to_string(),
            _ if *value == 0 => "null".to_string(),
            _ => format!("obj@{:x}", value),
        })
        .collect();
    st.invocations
        .push((class_name.to_string(), method_name.to_string(), described));
}

// Reply with a value matching the method's return type: a fresh object for
// reference returns (mapped to its class when that class is declared), void
// otherwise. No exception.
fn put_invoke_result(reply: &mut Vec<u8>, st: &mut VmState, config: &VmConfig, signature: &str) {
    let return_type = signature.rsplit(')').next().unwrap_or("V");
    if return_type.starts_with('L') {
        let object_id = st.next_object_id;
        st.next_object_id += 1;
        let name = crate::types::signature_to_class_name(return_type);
        if let Some(class) = config.class_by_name(&name) {
            st.objects.insert(object_id, class.class_id);
        }
        reply.put_u8(tags::OBJECT);
        reply.put_u64(object_id);
    } else {
        reply.put_u8(tags::VOID);
    }
    reply.put_u8(tags::OBJECT);
    reply.put_u64(0);
}

fn read_args(buf: &mut &[u8]) -> Vec<(u8, u64)> {
    let Ok(count) = read_i32(buf) else {
        return Vec::new();
    };
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Ok(tag) = read_u8(buf) else { break };
        let value = match tag {
            tags::BOOLEAN => u64::from(read_u8(buf).unwrap_or(0)),
            _ => read_u64(buf).unwrap_or(0),
        };
        args.push((tag, value));
    }
    args
}
