// Remote method evaluation on a suspended thread
//
// Invokes constructors, instance methods, and static methods inside the
// target VM and translates protocol-level invocation exceptions into a
// typed result. Arguments are restricted to the kinds the wire protocol can
// mirror into the remote type system without extra plumbing: strings,
// booleans, already-remote handles, and null.

use crate::classtype::InvokeReply;
use crate::commands::invoke_options;
use crate::connection::JdwpConnection;
use crate::protocol::JdwpResult;
use crate::reftype::MethodInfo;
use crate::types::{
    class_signature, signature_to_class_name, tags, MethodId, ObjectId, ReferenceTypeId, ThreadId,
    Value,
};
use tracing::{debug, warn};

/// Proof that a thread is suspended at a known method. Produced by a
/// breakpoint event; must not outlive the dispatch of that event, because
/// the thread resumes as soon as the event set is released.
#[derive(Debug, Clone)]
pub struct EvaluateContext {
    pub thread: ThreadId,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
}

/// Argument kinds the evaluator can marshal. A closed set by design: each
/// kind maps directly onto a mirrored remote value.
#[derive(Debug, Clone)]
pub enum CallArg {
    Str(String),
    Bool(bool),
    /// A reference already living in the remote heap.
    Object(ObjectId),
    Null,
}

impl From<&str> for CallArg {
    fn from(s: &str) -> Self {
        CallArg::Str(s.to_string())
    }
}

/// Outcome of one remote evaluation. Exactly one side is set: a value (which
/// may be void), or an error string carrying a protocol-level or
/// remote-exception message.
#[derive(Debug, Clone)]
pub enum EvaluateResult {
    Value(Value),
    Error(String),
}

impl EvaluateResult {
    pub fn has_error(&self) -> bool {
        matches!(self, EvaluateResult::Error(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            EvaluateResult::Error(e) => Some(e),
            EvaluateResult::Value(_) => None,
        }
    }

    /// The result as a remote object handle, when it is one.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            EvaluateResult::Value(v) => v.object_id(),
            EvaluateResult::Error(_) => None,
        }
    }
}

/// Remote evaluator bound to one session's connection.
#[derive(Clone)]
pub struct Evaluator {
    conn: JdwpConnection,
}

impl Evaluator {
    pub fn new(conn: JdwpConnection) -> Self {
        Self { conn }
    }

    /// Invoke a static method, or a constructor when `method_name` is the
    /// class-initializer sentinel `<init>`.
    pub async fn evaluate_static(
        &self,
        ctx: &EvaluateContext,
        class_name: &str,
        method_name: &str,
        method_signature: &str,
        args: &[CallArg],
    ) -> JdwpResult<EvaluateResult> {
        let Some(class_id) = self.find_class(class_name).await? else {
            return Ok(EvaluateResult::Error(format!(
                "can not find class {}",
                class_name
            )));
        };
        self.invoke(ctx, class_id, None, method_name, method_signature, args)
            .await
    }

    /// Invoke an instance method on a remote object.
    pub async fn evaluate_instance(
        &self,
        ctx: &EvaluateContext,
        object: ObjectId,
        method_name: &str,
        method_signature: &str,
        args: &[CallArg],
    ) -> JdwpResult<EvaluateResult> {
        let class_id = self.conn.get_object_reference_type(object).await?;
        self.invoke(
            ctx,
            class_id,
            Some(object),
            method_name,
            method_signature,
            args,
        )
        .await
    }

    async fn invoke(
        &self,
        ctx: &EvaluateContext,
        class_id: ReferenceTypeId,
        object: Option<ObjectId>,
        method_name: &str,
        method_signature: &str,
        args: &[CallArg],
    ) -> JdwpResult<EvaluateResult> {
        // The thread must still be suspended before anything is invoked;
        // otherwise the breakpoint window has closed and invoking would
        // corrupt state.
        let status = self.conn.thread_status(ctx.thread).await?;
        if !status.is_suspended() {
            return Ok(EvaluateResult::Error(
                "thread is not suspended".to_string(),
            ));
        }

        let Some(method) = self.find_method(class_id, method_name, method_signature).await? else {
            return Ok(EvaluateResult::Error(format!(
                "can not find method, method={} signature={}",
                method_name, method_signature
            )));
        };

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.marshal(arg).await?);
        }

        debug!(
            "invoking remote method: method={} signature={} args={}",
            method_name,
            method_signature,
            values.len()
        );

        let options = invoke_options::SINGLE_THREADED;
        let reply = if method_name == "<init>" {
            self.conn
                .class_new_instance(class_id, ctx.thread, method.method_id, &values, options)
                .await?
        } else if let Some(object) = object {
            self.conn
                .object_invoke_method(
                    object,
                    ctx.thread,
                    class_id,
                    method.method_id,
                    &values,
                    options,
                )
                .await?
        } else {
            self.conn
                .class_invoke_method(class_id, ctx.thread, method.method_id, &values, options)
                .await?
        };

        self.translate_reply(ctx, reply).await
    }

    async fn translate_reply(
        &self,
        ctx: &EvaluateContext,
        reply: InvokeReply,
    ) -> JdwpResult<EvaluateResult> {
        if reply.exception != 0 {
            let message = self.describe_remote_exception(ctx.thread, reply.exception).await;
            warn!("remote invocation threw: {}", message);
            return Ok(EvaluateResult::Error(message));
        }
        Ok(EvaluateResult::Value(reply.value))
    }

    /// Build "<type name> <message>" for a remote exception object by
    /// invoking its getMessage() on the same suspended thread. Every step
    /// here tolerates failure; a broken accessor must not mask the outer
    /// invocation error.
    async fn describe_remote_exception(&self, thread: ThreadId, exception: ObjectId) -> String {
        let mut message = String::new();

        let class_id = match self.conn.get_object_reference_type(exception).await {
            Ok(id) => id,
            Err(e) => {
                warn!("can not resolve remote exception type: {}", e);
                return "remote exception of unknown type".to_string();
            }
        };

        match self.conn.get_signature(class_id).await {
            Ok(signature) => {
                message.push_str(&signature_to_class_name(&signature));
                message.push(' ');
            }
            Err(e) => warn!("can not read remote exception signature: {}", e),
        }

        match self.find_method(class_id, "getMessage", "()Ljava/lang/String;").await {
            Ok(Some(method)) => {
                let invoked = self
                    .conn
                    .object_invoke_method(
                        exception,
                        thread,
                        class_id,
                        method.method_id,
                        &[],
                        invoke_options::SINGLE_THREADED,
                    )
                    .await;
                match invoked {
                    Ok(reply) if reply.exception == 0 => {
                        if let Some(string_id) = reply.value.object_id() {
                            match self.conn.get_string_value(string_id).await {
                                Ok(text) => message.push_str(&text),
                                Err(e) => warn!("can not read exception message: {}", e),
                            }
                        }
                    }
                    Ok(_) => warn!("getMessage itself threw in the remote VM"),
                    Err(e) => warn!("getMessage invocation failed: {}", e),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("can not list exception methods: {}", e),
        }

        message.trim_end().to_string()
    }

    async fn marshal(&self, arg: &CallArg) -> JdwpResult<Value> {
        match arg {
            CallArg::Str(s) => {
                let string_id = self.conn.create_string(s).await?;
                Ok(Value::object(tags::STRING, string_id))
            }
            CallArg::Bool(b) => Ok(Value::boolean(*b)),
            CallArg::Object(id) => Ok(Value::object(tags::OBJECT, *id)),
            CallArg::Null => Ok(Value::null()),
        }
    }

    async fn find_class(&self, class_name: &str) -> JdwpResult<Option<ReferenceTypeId>> {
        let signature = class_signature(class_name);
        let classes = self.conn.classes_by_signature(&signature).await?;
        Ok(classes.first().map(|c| c.type_id))
    }

    async fn find_method(
        &self,
        class_id: ReferenceTypeId,
        name: &str,
        signature: &str,
    ) -> JdwpResult<Option<MethodInfo>> {
        let methods = self.conn.get_methods(class_id).await?;
        Ok(methods
            .into_iter()
            .find(|m| m.name == name && m.signature == signature))
    }
}
