//! A named local registration point and its ordered dispatch.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use hubcall_protocol::{Capability, ErrorKind, RemoteMethodCall, RemoteMethodCallResults};
use hubcall_transport::Node;

use crate::{EndpointError, Implementor, InvocationContext, provides};

/// All local implementors registered under one name.
///
/// Every call is first given a number with [`take_a_number`](Self::take_a_number).
/// A single-threaded endpoint runs bodies strictly in number order: a call
/// holding number `n` waits until every number below `n` has finished.
pub struct Endpoint {
    name: String,
    capability: Capability,
    single_threaded: bool,
    implementors: Mutex<Vec<Arc<dyn Implementor>>>,
    next_number: AtomicU64,
    gate: Gate,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, capability: Capability, single_threaded: bool) -> Self {
        Self {
            name: name.into(),
            capability,
            single_threaded,
            implementors: Mutex::new(Vec::new()),
            next_number: AtomicU64::new(0),
            gate: Gate::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded
    }

    fn implementors(&self) -> MutexGuard<'_, Vec<Arc<dyn Implementor>>> {
        self.implementors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an implementor.
    ///
    /// # Errors
    /// [`EndpointError::CapabilityMismatch`] if the implementor does not
    /// provide this endpoint's capability.
    pub fn add_implementor(&self, implementor: Arc<dyn Implementor>) -> Result<(), EndpointError> {
        if !provides(implementor.as_ref(), &self.capability) {
            return Err(EndpointError::CapabilityMismatch {
                endpoint: self.name.clone(),
                required: self.capability.name.clone(),
            });
        }
        self.implementors().push(implementor);
        Ok(())
    }

    /// Removes an implementor by identity. Returns `true` when the endpoint
    /// has no implementors left.
    ///
    /// # Errors
    /// [`EndpointError::NotRegistered`] if this exact implementor was never
    /// added.
    pub fn remove_implementor(&self, implementor: &Arc<dyn Implementor>) -> Result<bool, EndpointError> {
        let mut implementors = self.implementors();
        let index = implementors
            .iter()
            .position(|existing| Arc::ptr_eq(existing, implementor))
            .ok_or_else(|| EndpointError::NotRegistered(self.name.clone()))?;
        implementors.remove(index);
        Ok(implementors.is_empty())
    }

    /// The first registered implementor, if any.
    pub fn first_implementor(&self) -> Option<Arc<dyn Implementor>> {
        self.implementors().first().cloned()
    }

    pub fn implementor_count(&self) -> usize {
        self.implementors().len()
    }

    /// Hands out the next sequence number. Numbers are strictly increasing.
    pub fn take_a_number(&self) -> u64 {
        self.next_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Gives up `number` without running anything, so later numbers do not
    /// wait on it. Blocks like [`invoke_local`](Self::invoke_local) until it
    /// is this number's turn.
    pub fn skip_number(&self, number: u64) {
        if self.single_threaded {
            drop(self.gate.wait_for(number));
        }
    }

    /// Runs `call` on every implementor, in registration order, and returns
    /// one result per implementor.
    ///
    /// Blocks: on a single-threaded endpoint this waits for every lower
    /// number to finish first. `number` must come from
    /// [`take_a_number`](Self::take_a_number) and is released when this
    /// returns, whatever happened.
    pub fn invoke_local(
        &self,
        call: &RemoteMethodCall,
        number: u64,
        calling_node: &Node,
    ) -> Vec<RemoteMethodCallResults> {
        let _turn = self.single_threaded.then(|| self.gate.wait_for(number));

        let implementors = self.implementors().clone();
        if let Some(rejection) = self.check_call(call) {
            return vec![rejection; implementors.len()];
        }

        let ctx = InvocationContext {
            calling_node: calling_node.clone(),
            sequence: number,
        };
        implementors
            .iter()
            .map(|implementor| run_one(implementor.as_ref(), &ctx, call))
            .collect()
    }

    fn check_call(&self, call: &RemoteMethodCall) -> Option<RemoteMethodCallResults> {
        if call.args.len() != call.arg_types.len() {
            return Some(RemoteMethodCallResults::error(
                ErrorKind::InvalidArgument,
                format!(
                    "{call} carries {} arguments for {} types",
                    call.args.len(),
                    call.arg_types.len()
                ),
            ));
        }
        if self.capability.find(&call.method_name, &call.arg_types).is_none() {
            return Some(RemoteMethodCallResults::error(
                ErrorKind::NoSuchMethod,
                format!("{} does not declare {call}", self.capability.name),
            ));
        }
        None
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("capability", &self.capability.name)
            .field("single_threaded", &self.single_threaded)
            .field("implementors", &self.implementor_count())
            .finish()
    }
}

fn run_one(
    implementor: &dyn Implementor,
    ctx: &InvocationContext,
    call: &RemoteMethodCall,
) -> RemoteMethodCallResults {
    match panic::catch_unwind(AssertUnwindSafe(|| implementor.invoke(ctx, call))) {
        Ok(Ok(value)) => RemoteMethodCallResults::Value(value),
        Ok(Err(error)) => {
            tracing::debug!(%call, error = %error, "implementor returned an error");
            RemoteMethodCallResults::Error(error)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(%call, %message, "implementor panicked");
            RemoteMethodCallResults::error(ErrorKind::ImplementorFailed, message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "implementor panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Lets number `n` through only after `n - 1` has been released.
#[derive(Default)]
struct Gate {
    runnable: Mutex<u64>,
    turn: Condvar,
}

impl Gate {
    fn wait_for(&self, number: u64) -> Turn<'_> {
        let guard = self.runnable.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .turn
            .wait_while(guard, |runnable| *runnable < number)
            .unwrap_or_else(PoisonError::into_inner);
        Turn { gate: self, number }
    }

    fn release(&self, number: u64) {
        let mut runnable = self.runnable.lock().unwrap_or_else(PoisonError::into_inner);
        *runnable = (*runnable).max(number + 1);
        self.turn.notify_all();
    }
}

/// Releases its number when dropped, including during unwinding.
struct Turn<'a> {
    gate: &'a Gate,
    number: u64,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.gate.release(self.number);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::DispatchTable;
    use hubcall_protocol::RemoteError;

    fn echo_capability() -> Capability {
        Capability::new("Echo").method("echo", ["string"])
    }

    fn echo(prefix: &'static str) -> Arc<dyn Implementor> {
        Arc::new(DispatchTable::new("Echo").method("echo", ["string"], move |_, args| {
            Ok(json!(format!("{prefix}{}", args[0].as_str().unwrap_or_default())))
        }))
    }

    fn echo_call(text: &str) -> RemoteMethodCall {
        RemoteMethodCall::new("echo", "echo").arg("string", text)
    }

    struct Panicky;

    impl Implementor for Panicky {
        fn capabilities(&self) -> Vec<Capability> {
            vec![echo_capability()]
        }

        fn invoke(&self, _: &InvocationContext, _: &RemoteMethodCall) -> Result<Value, RemoteError> {
            panic!("boom");
        }
    }

    // =====================================================================
    // Registration
    // =====================================================================

    #[test]
    fn test_add_implementor_wrong_capability_is_rejected() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        let other: Arc<dyn Implementor> =
            Arc::new(DispatchTable::new("Other").method("echo", ["string"], |_, _| Ok(json!(1))));

        let result = endpoint.add_implementor(other);
        assert!(matches!(result, Err(EndpointError::CapabilityMismatch { .. })));
        assert_eq!(endpoint.implementor_count(), 0);
    }

    #[test]
    fn test_remove_implementor_reports_empty() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        let a = echo("a:");
        let b = echo("b:");
        endpoint.add_implementor(Arc::clone(&a)).unwrap();
        endpoint.add_implementor(Arc::clone(&b)).unwrap();

        assert!(!endpoint.remove_implementor(&a).unwrap());
        assert!(endpoint.remove_implementor(&b).unwrap());
        assert_eq!(endpoint.implementor_count(), 0);
    }

    #[test]
    fn test_remove_implementor_unknown_is_error() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        endpoint.add_implementor(echo("a:")).unwrap();
        let stranger = echo("a:");

        assert!(matches!(
            endpoint.remove_implementor(&stranger),
            Err(EndpointError::NotRegistered(_))
        ));
        assert_eq!(endpoint.implementor_count(), 1);
    }

    #[test]
    fn test_first_implementor_is_registration_order() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        let a = echo("a:");
        endpoint.add_implementor(Arc::clone(&a)).unwrap();
        endpoint.add_implementor(echo("b:")).unwrap();
        assert!(Arc::ptr_eq(&endpoint.first_implementor().unwrap(), &a));
    }

    // =====================================================================
    // Numbers
    // =====================================================================

    #[test]
    fn test_take_a_number_strictly_increasing() {
        let endpoint = Endpoint::new("echo", echo_capability(), true);
        let numbers: Vec<u64> = (0..100).map(|_| endpoint.take_a_number()).collect();
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
    }

    // =====================================================================
    // Invocation
    // =====================================================================

    #[test]
    fn test_invoke_local_one_result_per_implementor_in_order() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        endpoint.add_implementor(echo("a:")).unwrap();
        endpoint.add_implementor(echo("b:")).unwrap();

        let number = endpoint.take_a_number();
        let results = endpoint.invoke_local(&echo_call("hi"), number, &Node::new("host"));

        assert_eq!(
            results,
            vec![
                RemoteMethodCallResults::Value(json!("a:hi")),
                RemoteMethodCallResults::Value(json!("b:hi")),
            ]
        );
    }

    #[test]
    fn test_invoke_local_undeclared_method_is_no_such_method() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        endpoint.add_implementor(echo("a:")).unwrap();

        let call = RemoteMethodCall::new("echo", "shout").arg("string", "hi");
        let results = endpoint.invoke_local(&call, endpoint.take_a_number(), &Node::new("host"));

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind(), Some(ErrorKind::NoSuchMethod));
    }

    #[test]
    fn test_invoke_local_mismatched_argument_count_is_invalid() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        endpoint.add_implementor(echo("a:")).unwrap();

        let mut call = echo_call("hi");
        call.args.push(json!(1));
        let results = endpoint.invoke_local(&call, endpoint.take_a_number(), &Node::new("host"));
        assert_eq!(results[0].error_kind(), Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_invoke_local_panic_is_captured_and_number_released() {
        let endpoint = Endpoint::new("echo", echo_capability(), true);
        endpoint.add_implementor(Arc::new(Panicky)).unwrap();

        let first = endpoint.take_a_number();
        let results = endpoint.invoke_local(&echo_call("hi"), first, &Node::new("host"));
        assert_eq!(results[0].error_kind(), Some(ErrorKind::ImplementorFailed));
        assert!(results[0].clone().into_result().unwrap_err().message.contains("boom"));

        // The next number must not wait forever on the failed one.
        let second = endpoint.take_a_number();
        let results = endpoint.invoke_local(&echo_call("hi"), second, &Node::new("host"));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_invoke_local_returned_error_keeps_its_kind() {
        let endpoint = Endpoint::new("echo", echo_capability(), false);
        endpoint
            .add_implementor(Arc::new(DispatchTable::new("Echo").method("echo", ["string"], |_, _| {
                Err(RemoteError::new(ErrorKind::NotFound, "no such room"))
            })))
            .unwrap();

        let results = endpoint.invoke_local(&echo_call("hi"), endpoint.take_a_number(), &Node::new("host"));
        assert_eq!(
            results,
            vec![RemoteMethodCallResults::error(ErrorKind::NotFound, "no such room")]
        );
    }

    #[test]
    fn test_skip_number_lets_later_numbers_run() {
        let endpoint = Endpoint::new("echo", echo_capability(), true);
        endpoint.add_implementor(echo("a:")).unwrap();

        let skipped = endpoint.take_a_number();
        let next = endpoint.take_a_number();
        endpoint.skip_number(skipped);

        let results = endpoint.invoke_local(&echo_call("hi"), next, &Node::new("host"));
        assert_eq!(results, vec![RemoteMethodCallResults::Value(json!("a:hi"))]);
    }

    #[test]
    fn test_skip_number_waits_for_its_turn() {
        let endpoint = Arc::new(Endpoint::new("echo", echo_capability(), true));
        let first = endpoint.take_a_number();
        let skipped = endpoint.take_a_number();

        let skipper = {
            let endpoint = Arc::clone(&endpoint);
            std::thread::spawn(move || endpoint.skip_number(skipped))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!skipper.is_finished());

        endpoint.skip_number(first);
        skipper.join().unwrap();
    }

    #[test]
    fn test_invoke_local_no_implementors_is_empty() {
        let endpoint = Endpoint::new("echo", echo_capability(), true);
        let results = endpoint.invoke_local(&echo_call("hi"), endpoint.take_a_number(), &Node::new("host"));
        assert!(results.is_empty());
    }
}
