//! Calibration tables waiting to be applied to registered datasets.

use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::ContextError;

/// A calibration table, and how to apply it to one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalApplication {
    /// The dataset the table applies to.
    pub vis: String,
    /// The calibration table.
    pub gaintable: PathBuf,
    /// Field selection the solutions apply to, empty for all.
    pub field: String,
    /// Spectral window selection, empty for all.
    pub spw: String,
    /// Interpolation in time.
    pub interp: String,
    /// Whether to calibrate the weights.
    pub calwt: bool,
    /// The stage that produced the table.
    pub stage: usize,
}

/// Every calibration registered so far, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalLibrary {
    applications: Vec<CalApplication>,
}

impl CalLibrary {
    /// Register a table.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DuplicateRegistration`] if the same table is already registered
    /// for the same dataset.
    pub fn add(&mut self, application: CalApplication) -> Result<(), ContextError> {
        if self
            .applications
            .iter()
            .any(|a| a.vis == application.vis && a.gaintable == application.gaintable)
        {
            return Err(ContextError::DuplicateRegistration {
                kind: "calibration",
                name: format!("{} -> {}", application.gaintable.display(), application.vis),
            });
        }
        self.applications.push(application);
        Ok(())
    }

    /// Tables to apply to `vis`, oldest first.
    pub fn applications_for(&self, vis: &str) -> Vec<&CalApplication> {
        self.applications.iter().filter(|a| a.vis == vis).collect()
    }

    /// Forget every table registered for `vis`, returning them.
    pub fn remove_for(&mut self, vis: &str) -> Vec<CalApplication> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .applications
            .drain(..)
            .partition(|a| a.vis == vis);
        self.applications = kept;
        removed
    }

    /// All registered tables.
    pub fn applications(&self) -> &[CalApplication] {
        &self.applications
    }

    /// The gain tables for `vis`, joined for an engine `gaintable` argument.
    pub fn gaintable_arg(&self, vis: &str) -> String {
        self.applications_for(vis)
            .iter()
            .map(|a| a.gaintable.display().to_string())
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application(vis: &str, table: &str) -> CalApplication {
        CalApplication {
            vis: vis.into(),
            gaintable: table.into(),
            field: String::new(),
            spw: String::new(),
            interp: "linear".into(),
            calwt: false,
            stage: 2,
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let mut lib = CalLibrary::default();
        lib.add(application("ds1", "ds1.s2.gcal")).unwrap();
        lib.add(application("ds1", "ds1.s3.bcal")).unwrap();
        lib.add(application("ds2", "ds2.s2.gcal")).unwrap();

        assert_eq!(lib.applications_for("ds1").len(), 2);
        assert_eq!(lib.gaintable_arg("ds1"), "ds1.s2.gcal,ds1.s3.bcal");
        assert!(matches!(
            lib.add(application("ds1", "ds1.s2.gcal")),
            Err(ContextError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn test_remove_for() {
        let mut lib = CalLibrary::default();
        lib.add(application("ds1", "ds1.s2.gcal")).unwrap();
        lib.add(application("ds2", "ds2.s2.gcal")).unwrap();
        let removed = lib.remove_for("ds1");
        assert_eq!(removed.len(), 1);
        assert_eq!(lib.applications().len(), 1);
        assert!(lib.applications_for("ds1").is_empty());
    }
}
