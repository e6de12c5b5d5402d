use crate::{store::Store, Error};
use gatekeeper_constraint_controller_k8s_api::{
    pod_status::{EnforcementPointState, EnforcementPointStatus},
    ConstraintPodStatus, PodStatus,
};

/// Records `error` on `status` and persists it.
///
/// Returns the error to hand back to the caller. When the status cannot be
/// written, both failures are kept.
pub(crate) async fn report_error(
    store: &dyn Store,
    status: &mut ConstraintPodStatus,
    error: Error,
) -> Error {
    let s = pod_status(status);
    s.enforced = false;
    s.push_error(error.code(), &error);

    match store.update_pod_status(status).await {
        Ok(updated) => {
            *status = updated;
            error
        }
        Err(status) => Error::StatusUpdate {
            error: Box::new(error),
            status,
        },
    }
}

pub(crate) fn pod_status(status: &mut ConstraintPodStatus) -> &mut PodStatus {
    status.status.get_or_insert_with(Default::default)
}

pub(crate) fn set_enforcement_point(
    status: &mut ConstraintPodStatus,
    point: &str,
    state: EnforcementPointState,
    observed_generation: Option<i64>,
    message: Option<String>,
) {
    pod_status(status).enforcement_points_status.insert(
        point.to_string(),
        EnforcementPointStatus {
            state,
            observed_generation,
            message,
        },
    );
}

pub(crate) fn clear_enforcement_point(status: &mut ConstraintPodStatus, point: &str) {
    pod_status(status).enforcement_points_status.remove(point);
}
