use fv_core::visit_contracts::VisitCompletedEvent;
use fv_engine::{ClientDirectory, CompletionNotifier, DirectoryError, NotifyError, RemoteClient};
use std::time::Duration;
use tracing::info;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build()
}

/// Client directory backed by a remote HTTP service.
pub struct HttpDirectory {
    agent: ureq::Agent,
    base: String,
}

impl HttpDirectory {
    pub fn new(base: &str) -> Self {
        Self {
            agent: http_agent(),
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

impl ClientDirectory for HttpDirectory {
    fn find_client(&self, id: &str) -> Result<Option<RemoteClient>, DirectoryError> {
        let url = format!("{}/clients/{id}", self.base);
        match self.agent.get(&url).call() {
            Ok(response) => response
                .into_json::<RemoteClient>()
                .map(Some)
                .map_err(|err| DirectoryError(err.to_string())),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => Err(DirectoryError(err.to_string())),
        }
    }

    fn search_clients(&self, query: &str) -> Result<Vec<RemoteClient>, DirectoryError> {
        let url = format!("{}/clients", self.base);
        self.agent
            .get(&url)
            .query("search", query)
            .call()
            .map_err(|err| DirectoryError(err.to_string()))?
            .into_json::<Vec<RemoteClient>>()
            .map_err(|err| DirectoryError(err.to_string()))
    }
}

/// Posts completion events to a webhook, one JSON body per visit.
pub struct WebhookNotifier {
    agent: ureq::Agent,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            agent: http_agent(),
            url: url.to_string(),
        }
    }
}

impl CompletionNotifier for WebhookNotifier {
    fn notify_visit_completed(&self, event: &VisitCompletedEvent) -> Result<(), NotifyError> {
        self.agent
            .post(&self.url)
            .send_json(event)
            .map_err(|err| NotifyError(err.to_string()))?;
        info!(visit_id = %event.visit_id, "completion webhook delivered");
        Ok(())
    }
}
