//! Leads API client.
//!
//! CRUD calls for the dashboard's lead table. Every call goes through the
//! session manager so an unrecoverable 401 signs the user out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::ApiRequest;
use crate::session::SessionManager;
use crate::Result;

const LEADS_PATH: &str = "/leads/";

/// A lead as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: uuid::Uuid,
    pub business_name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub lead_score: Option<i64>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub contact_person: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub contact_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields for creating a lead
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLead {
    pub business_name: String,
    pub industry: String,
    pub lead_score: i64,
    #[serde(default)]
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_person: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub designation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Partial update; only set fields are sent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_person: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub designation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl LeadUpdate {
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| v.as_object().map_or(true, |o| o.is_empty()))
            .unwrap_or(true)
    }
}

/// Filters accepted by list and count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadFilter {
    pub industry: Option<String>,
    pub min_lead_score: Option<i64>,
    pub max_lead_score: Option<i64>,
}

impl LeadFilter {
    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        if let Some(industry) = &self.industry {
            request = request.query("industry", industry);
        }
        if let Some(min) = self.min_lead_score {
            request = request.query("min_lead_score", min);
        }
        if let Some(max) = self.max_lead_score {
            request = request.query("max_lead_score", max);
        }
        request
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CountResponse {
    Bare(u64),
    Wrapped { count: u64 },
}

/// Leads endpoints
#[derive(Clone)]
pub struct LeadsApi {
    session: SessionManager,
}

impl LeadsApi {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    pub async fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>> {
        let request = filter.apply(ApiRequest::get(LEADS_PATH));
        self.session.authorized(&request).await
    }

    pub async fn count(&self, filter: &LeadFilter) -> Result<u64> {
        let request = filter.apply(ApiRequest::get(format!("{LEADS_PATH}count")));
        let count: CountResponse = self.session.authorized(&request).await?;
        Ok(match count {
            CountResponse::Bare(n) | CountResponse::Wrapped { count: n } => n,
        })
    }

    pub async fn get(&self, id: uuid::Uuid) -> Result<Lead> {
        self.session
            .authorized(&ApiRequest::get(format!("{LEADS_PATH}{id}")))
            .await
    }

    pub async fn create(&self, lead: &NewLead) -> Result<Lead> {
        let request = ApiRequest::post(LEADS_PATH).json(serde_json::to_value(lead)?);
        self.session.authorized(&request).await
    }

    pub async fn update(&self, id: uuid::Uuid, update: &LeadUpdate) -> Result<Lead> {
        let request = ApiRequest::put(format!("{LEADS_PATH}{id}")).json(serde_json::to_value(update)?);
        self.session.authorized(&request).await
    }

    pub async fn delete(&self, id: uuid::Uuid) -> Result<()> {
        let _: Value = self
            .session
            .authorized(&ApiRequest::delete(format!("{LEADS_PATH}{id}")))
            .await?;
        tracing::info!(lead = %id, "Lead deleted");
        Ok(())
    }
}
