use crate::api::RuntimePhase;

/// Phase of a component with `ready` of `desired` replicas up.
///
/// Total over all inputs: no ready replicas is `NotReady` unless none are desired.
pub fn classify_phase(desired: i32, ready: i32) -> RuntimePhase {
    if ready >= desired {
        RuntimePhase::Ready
    } else if ready <= 0 {
        RuntimePhase::NotReady
    } else {
        RuntimePhase::PartialReady
    }
}

/// Whether the component serves at least partially.
pub(crate) fn is_serving(phase: RuntimePhase) -> bool {
    matches!(phase, RuntimePhase::Ready | RuntimePhase::PartialReady)
}
