// Breakpoint variants and their enable/disable behavior
//
// A breakpoint holds at most one live event request. The only variant today
// is a method-entry watch; the enum leaves room for location breakpoints
// without changing the session's registry.

use crate::connection::JdwpConnection;
use crate::eventrequest::SuspendPolicy;
use crate::protocol::JdwpResult;
use crate::types::class_signature;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum BreakpointKind {
    MethodEntry {
        class_name: String,
        method_name: String,
    },
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    kind: BreakpointKind,
    suspend_policy: SuspendPolicy,
    enabled: bool,
    request_id: Option<i32>,
}

impl Breakpoint {
    /// Breakpoint on entry into `class_name.method_name`, suspending only the
    /// hitting thread.
    pub fn method_entry(class_name: &str, method_name: &str) -> Self {
        Self {
            kind: BreakpointKind::MethodEntry {
                class_name: class_name.to_string(),
                method_name: method_name.to_string(),
            },
            suspend_policy: SuspendPolicy::EventThread,
            enabled: false,
            request_id: None,
        }
    }

    pub fn with_suspend_policy(mut self, suspend_policy: SuspendPolicy) -> Self {
        self.suspend_policy = suspend_policy;
        self
    }

    pub fn class_name(&self) -> &str {
        match &self.kind {
            BreakpointKind::MethodEntry { class_name, .. } => class_name,
        }
    }

    pub fn method_name(&self) -> &str {
        match &self.kind {
            BreakpointKind::MethodEntry { method_name, .. } => method_name,
        }
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.suspend_policy
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn request_id(&self) -> Option<i32> {
        self.request_id
    }

    /// Does a method-entry event on this method name belong to us?
    pub fn matches(&self, method_name: &str) -> bool {
        match &self.kind {
            BreakpointKind::MethodEntry {
                method_name: own, ..
            } => own == method_name,
        }
    }

    /// Install the event request in the VM.
    ///
    /// Returns `None` when the target class is not loaded yet; callers retry
    /// or accept a partial breakpoint set. Enabling an armed breakpoint is a
    /// no-op.
    pub(crate) async fn enable(&mut self, conn: &JdwpConnection) -> JdwpResult<Option<i32>> {
        if let Some(id) = self.request_id {
            return Ok(Some(id));
        }

        match &self.kind {
            BreakpointKind::MethodEntry { class_name, .. } => {
                let signature = class_signature(class_name);
                let classes = conn.classes_by_signature(&signature).await?;
                let Some(class) = classes.first() else {
                    warn!("can not find class {} in the target VM", class_name);
                    return Ok(None);
                };

                let id = conn
                    .set_method_entry_request(class.type_id, self.suspend_policy)
                    .await?;
                self.request_id = Some(id);
                self.enabled = true;
                Ok(Some(id))
            }
        }
    }

    /// Clear the event request. Disabling an unarmed breakpoint is a no-op.
    pub(crate) async fn disable(&mut self, conn: &JdwpConnection) -> JdwpResult<()> {
        if let Some(id) = self.request_id.take() {
            conn.clear_method_entry_request(id).await?;
        }
        self.enabled = false;
        Ok(())
    }
}

impl std::fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class_name(), self.method_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_entry_breakpoint() {
        let bp = Breakpoint::method_entry("android.app.Activity", "onCreate");
        assert_eq!(bp.class_name(), "android.app.Activity");
        assert_eq!(bp.method_name(), "onCreate");
        assert_eq!(bp.suspend_policy(), SuspendPolicy::EventThread);
        assert!(!bp.is_enabled());
        assert!(bp.request_id().is_none());
        assert!(bp.matches("onCreate"));
        assert!(!bp.matches("onResume"));
        assert_eq!(bp.to_string(), "android.app.Activity.onCreate");
    }
}
