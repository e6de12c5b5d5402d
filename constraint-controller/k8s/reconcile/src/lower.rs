use crate::{
    metrics::BindingState,
    status::{self, clear_enforcement_point, set_enforcement_point},
    store::StoreError,
    Error, Reconciler,
};
use gatekeeper_constraint_controller_core::{
    enforcement_action::BINDING_ENFORCEMENT_POINT, EnforcementAction,
};
use gatekeeper_constraint_controller_k8s_api::{
    binding::binding_name, pod_status::EnforcementPointState, template::template_name, Binding,
    BindingVersion, ConstraintPodStatus, DynamicObject, DynamicRecord,
};
use gatekeeper_constraint_controller_k8s_binding::{
    binding_actions, gate, template::should_generate, transform, Gate, TemplateError,
};
use std::time::Duration;

impl Reconciler {
    /// Brings the constraint's binding in line with its enforcement action.
    ///
    /// Returns the remaining wait when the template's timing gate holds
    /// generation back. Failures are recorded on `status` before they are
    /// returned.
    pub(crate) async fn lower(
        &self,
        constraint: &DynamicObject,
        action: EnforcementAction,
        status: &mut ConstraintPodStatus,
    ) -> Result<Option<Duration>, Error> {
        let name = binding_name(constraint.name());
        match self.lower_binding(&name, constraint, action, status).await {
            Ok(requeue) => Ok(requeue),
            Err(error) => {
                tracing::warn!(binding = %name, %error, "Failed to reconcile binding");
                self.metrics.report_binding(&name, BindingState::Error);
                set_enforcement_point(
                    status,
                    BINDING_ENFORCEMENT_POINT,
                    EnforcementPointState::Error,
                    constraint.generation(),
                    Some(error.to_string()),
                );
                Err(status::report_error(&*self.store, status, error).await)
            }
        }
    }

    async fn lower_binding(
        &self,
        name: &str,
        constraint: &DynamicObject,
        action: EnforcementAction,
        status: &mut ConstraintPodStatus,
    ) -> Result<Option<Duration>, Error> {
        let generation = constraint.generation();
        let actions = binding_actions(
            action,
            constraint.spec(),
            self.config.default_create_binding,
        )?;

        let Some(version) = self.probe.version().await else {
            // No binding of any version can exist.
            if actions.is_empty() {
                clear_enforcement_point(status, BINDING_ENFORCEMENT_POINT);
            } else {
                set_enforcement_point(
                    status,
                    BINDING_ENFORCEMENT_POINT,
                    EnforcementPointState::Error,
                    generation,
                    Some(format!("{} is not served", BindingVersion::KIND)),
                );
            }
            return Ok(None);
        };

        if actions.is_empty() {
            self.remove_binding(version, name, status, None).await?;
            return Ok(None);
        }

        let kind = constraint.kind().unwrap_or_default();
        let template = match self.store.get_template(&template_name(kind)).await {
            Ok(template) => template,
            Err(error) if error.is_not_found() => {
                let reason = Some(error.to_string());
                self.remove_binding(version, name, status, reason).await?;
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        match should_generate(&template, self.config.default_create_policy) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(template = %kind, "Template does not generate policies");
                self.remove_binding(version, name, status, None).await?;
                return Ok(None);
            }
            Err(error @ TemplateError::EngineMissing(_)) => {
                let reason = Some(error.to_string());
                self.remove_binding(version, name, status, reason).await?;
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        if let Gate::Blocked(remaining) =
            gate::evaluate(&template, self.config.default_wait, (self.clock)())?
        {
            tracing::debug!(binding = %name, ?remaining, "Binding generation is blocked");
            set_enforcement_point(
                status,
                BINDING_ENFORCEMENT_POINT,
                EnforcementPointState::Waiting,
                generation,
                Some("waiting for the template's resources to propagate".to_string()),
            );
            return Ok(Some(remaining));
        }

        let desired = transform::binding(constraint, &actions, version)?;
        self.apply_binding(desired).await?;

        set_enforcement_point(
            status,
            BINDING_ENFORCEMENT_POINT,
            EnforcementPointState::Generated,
            generation,
            None,
        );
        self.metrics.report_binding(name, BindingState::Active);
        Ok(None)
    }

    /// Creates `desired`, or updates the existing binding when it differs.
    async fn apply_binding(&self, desired: Binding) -> Result<(), StoreError> {
        let mut current = match self.store.get_binding(desired.version(), desired.name()).await {
            Ok(current) => current,
            Err(error) if error.is_not_found() => {
                self.store.create_binding(&desired).await?;
                tracing::info!(binding = %desired.name(), version = %desired.version(), "Created binding");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let owner_changed = adopt(&mut current, &desired);
        if current.spec_eq(&desired) && !owner_changed {
            tracing::debug!(binding = %desired.name(), "Binding is up to date");
            return Ok(());
        }

        current.copy_spec_from(&desired);
        self.store.update_binding(&current).await?;
        tracing::info!(binding = %desired.name(), version = %desired.version(), "Updated binding");
        Ok(())
    }

    /// Removes the binding, recording `reason` on the enforcement point if
    /// one is given and clearing the entry otherwise.
    async fn remove_binding(
        &self,
        version: BindingVersion,
        name: &str,
        status: &mut ConstraintPodStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        self.delete_binding(version, name).await?;
        match reason {
            Some(message) => set_enforcement_point(
                status,
                BINDING_ENFORCEMENT_POINT,
                EnforcementPointState::Error,
                None,
                Some(message),
            ),
            None => clear_enforcement_point(status, BINDING_ENFORCEMENT_POINT),
        }
        Ok(())
    }

    /// Deletes the binding if it exists and drops its metric series.
    pub(crate) async fn delete_binding(
        &self,
        version: BindingVersion,
        name: &str,
    ) -> Result<(), StoreError> {
        match self.store.delete_binding(version, name).await {
            Ok(()) => tracing::info!(binding = %name, %version, "Deleted binding"),
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        self.metrics.remove_binding(name);
        Ok(())
    }
}

/// Points `current`'s controller reference at `desired`'s owner.
///
/// Returns true if the references changed.
fn adopt(current: &mut Binding, desired: &Binding) -> bool {
    let Some(owner) = desired
        .metadata()
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.controller == Some(true))
    else {
        return false;
    };

    let refs = current
        .metadata_mut()
        .owner_references
        .get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r == owner) {
        return false;
    }
    // Only one controller reference is allowed.
    refs.retain(|r| r.controller != Some(true));
    refs.push(owner.clone());
    true
}
