//! Application seam: the code that runs inside the critical section.

use crate::coordinator::CoordinatorStatus;
use crate::ProcessId;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// Application hosted by a coordinator.
///
/// The coordinator calls [`Application::do_critical_section`] every time the
/// token arrives, whether or not a request is outstanding. Implementations
/// decide for themselves, usually via
/// [`Application::requested_critical_section`], whether there is work to do.
#[async_trait]
pub trait Application: Send + Sync {
    /// Run the critical section. The token stays put until this returns.
    async fn do_critical_section(&self, grant: &Grant);

    /// True while the application is executing its critical section.
    fn in_critical_section(&self) -> bool;

    /// True when the application has an outstanding request.
    fn requested_critical_section(&self) -> bool;
}

#[async_trait]
impl<A: Application + ?Sized> Application for Arc<A> {
    async fn do_critical_section(&self, grant: &Grant) {
        (**self).do_critical_section(grant).await
    }

    fn in_critical_section(&self) -> bool {
        (**self).in_critical_section()
    }

    fn requested_critical_section(&self) -> bool {
        (**self).requested_critical_section()
    }
}

/// Handed to the application for the duration of one critical section.
pub struct Grant {
    process_id: ProcessId,
    request_number: u64,
    status: watch::Receiver<CoordinatorStatus>,
}

impl Grant {
    pub(crate) fn new(
        process_id: ProcessId,
        request_number: u64,
        status: watch::Receiver<CoordinatorStatus>,
    ) -> Self {
        Self {
            process_id,
            request_number,
            status,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Own request counter at the time the token arrived.
    pub fn request_number(&self) -> u64 {
        self.request_number
    }

    /// Live check that this peer still holds the token and may be inside.
    pub fn can_enter(&self) -> bool {
        self.status.borrow().can_enter_critical_section()
    }
}
