//! Listing and date-facet queries as the presentation layer asks for them.

use chrono::NaiveDate;
use std::sync::Arc;

use crate::database::ClipStore;
use crate::error::StoreError;
use crate::models::{Clip, ClipQuery};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct QueryService {
    store: Arc<ClipStore>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|e| StoreError::Invalid(format!("bad date '{}': {}", value, e)))
}

impl QueryService {
    pub fn new(store: Arc<ClipStore>) -> Self {
        Self { store }
    }

    /// Empty or blank filters mean "no filter". Dates are `YYYY-MM-DD`.
    pub fn get_clips(
        &self,
        search_text: Option<&str>,
        date_filter: Option<&str>,
    ) -> Result<Vec<Clip>, StoreError> {
        let query = ClipQuery {
            search_text: non_empty(search_text).map(str::to_string),
            date_filter: non_empty(date_filter).map(parse_date).transpose()?,
            limit: None,
        };
        self.store.query(&query)
    }

    /// Dates over the whole history, newest first, as `YYYY-MM-DD`.
    pub fn get_dates_with_clips(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .list_distinct_dates()?
            .into_iter()
            .map(|d| d.format(DATE_FORMAT).to_string())
            .collect())
    }
}
