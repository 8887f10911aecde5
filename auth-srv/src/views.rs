//! HTML pages rendered with Handlebars

use anyhow::{Result, anyhow};
use chrono::DateTime;
use esgf_auth::providers::KnownProvider;
use esgf_auth::ticket::Ticket;
use handlebars::Handlebars;
use serde::Serialize;

const HOME_TEMPLATE: &str = "home";
const THREDDS_TEMPLATE: &str = "thredds";

/// Login page, or the identity of a logged in user
#[derive(Debug, Default, Serialize)]
pub struct HomePage {
    pub openid_identifier: Option<String>,
    pub known_providers: Vec<KnownProvider>,
    pub redirect: Option<String>,
    pub message: Option<String>,
}

/// Stand-in for the THREDDS authentication filter
#[derive(Debug, Serialize)]
pub struct ThreddsPage {
    pub session_cookie_name: String,
    pub redirect: String,
    pub login_url: String,
    pub session_cookie: Option<String>,
    pub ticket: Option<TicketView>,
}

#[derive(Debug, Serialize)]
pub struct TicketView {
    pub subject: String,
    pub issued_at: String,
    pub client_address: String,
    pub tokens: String,
    pub user_data: String,
}

impl From<&Ticket> for TicketView {
    fn from(ticket: &Ticket) -> Self {
        let issued_at = DateTime::from_timestamp(ticket.issued_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| ticket.issued_at.to_string());
        Self {
            subject: ticket.subject.clone(),
            issued_at,
            client_address: ticket.client_address.clone(),
            tokens: ticket.tokens_string(),
            user_data: ticket.user_data.clone(),
        }
    }
}

pub struct Views {
    handlebars: Handlebars<'static>,
}

impl Views {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars
            .register_template_string(HOME_TEMPLATE, include_str!("../templates/home.hbs"))
            .map_err(|e| anyhow!("Failed to register home template: {e}"))?;
        handlebars
            .register_template_string(THREDDS_TEMPLATE, include_str!("../templates/thredds.hbs"))
            .map_err(|e| anyhow!("Failed to register thredds template: {e}"))?;
        Ok(Self { handlebars })
    }

    pub fn home(&self, page: &HomePage) -> Result<String> {
        self.handlebars
            .render(HOME_TEMPLATE, page)
            .map_err(|e| anyhow!("Failed to render home page: {e}"))
    }

    pub fn thredds(&self, page: &ThreddsPage) -> Result<String> {
        self.handlebars
            .render(THREDDS_TEMPLATE, page)
            .map_err(|e| anyhow!("Failed to render thredds page: {e}"))
    }
}
