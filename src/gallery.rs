// Gallery controller: filtering, selection and bulk delete over stored captures

use crate::error::{MoodcamError, Result};
use crate::models::Emotion;
use crate::notify::{Notice, Notifier};
use crate::store::{Capture, CaptureId, CaptureStore, DeleteOutcome};
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Which captures the gallery shows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Filter {
    #[default]
    All,
    Label(Emotion),
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::All => write!(f, "All"),
            Filter::Label(label) => write!(f, "{label}"),
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Filter::All);
        }
        Emotion::from_label(s)
            .map(Filter::Label)
            .ok_or_else(|| format!("unknown filter '{s}'"))
    }
}

/// A stored capture decorated with the transient selection flag
#[derive(Clone, Debug, PartialEq)]
pub struct GalleryItem {
    pub capture: Capture,
    pub selected: bool,
}

/// Outcome of clicking a capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Activation {
    /// PNG bytes for a zoomed preview
    Zoom(Vec<u8>),
    Toggled { id: CaptureId, selected: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteReport {
    NothingSelected,
    Deleted(DeleteOutcome),
}

#[derive(Debug, Default)]
pub struct Gallery {
    items: Vec<GalleryItem>,
    filter: Filter,
    selection_mode: bool,
}

impl Gallery {
    pub fn from_captures(captures: Vec<Capture>) -> Self {
        Self {
            items: captures
                .into_iter()
                .map(|capture| GalleryItem {
                    capture,
                    selected: false,
                })
                .collect(),
            ..Self::default()
        }
    }

    pub async fn load(store: &CaptureStore) -> Result<Self> {
        let captures = store.list().await?;
        debug!("Gallery loaded {} capture(s)", captures.len());
        Ok(Self::from_captures(captures))
    }

    /// Reloads from the store, keeping selection flags of captures still present
    pub async fn refresh(&mut self, store: &CaptureStore) -> Result<()> {
        let captures = store.list().await?;
        let selected: HashSet<CaptureId> = self.selected_ids().into_iter().collect();
        self.items = captures
            .into_iter()
            .map(|capture| GalleryItem {
                selected: self.selection_mode && selected.contains(&capture.id()),
                capture,
            })
            .collect();
        Ok(())
    }

    pub fn items(&self) -> &[GalleryItem] {
        &self.items
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    /// Items under the current filter.
    ///
    /// `All` keeps stored order. A label keeps captures with a nonzero score
    /// for it, highest first; equal scores keep stored order.
    pub fn view(&self) -> Vec<&GalleryItem> {
        match self.filter {
            Filter::All => self.items.iter().collect(),
            Filter::Label(label) => {
                let mut matching: Vec<(&GalleryItem, f32)> = self
                    .items
                    .iter()
                    .filter_map(|item| {
                        item.capture
                            .score(label)
                            .filter(|score| *score > 0.0)
                            .map(|score| (item, score))
                    })
                    .collect();
                matching.sort_by(|a, b| b.1.total_cmp(&a.1));
                matching.into_iter().map(|(item, _)| item).collect()
            }
        }
    }

    /// "All" followed by every label with a nonzero score somewhere
    pub fn available_filters(&self) -> Vec<Filter> {
        let mut filters = vec![Filter::All];
        filters.extend(
            Emotion::ALL
                .iter()
                .filter(|&&label| {
                    self.items
                        .iter()
                        .any(|item| item.capture.score(label).is_some_and(|s| s > 0.0))
                })
                .map(|&label| Filter::Label(label)),
        );
        filters
    }

    pub fn selection_mode(&self) -> bool {
        self.selection_mode
    }

    /// Enters or leaves selection mode; leaving clears every selection
    pub fn toggle_selection_mode(&mut self) -> bool {
        self.selection_mode = !self.selection_mode;
        if !self.selection_mode {
            self.items.iter_mut().for_each(|item| item.selected = false);
        }
        self.selection_mode
    }

    /// Flips one capture's selection and returns the new flag
    pub fn toggle_select(&mut self, id: CaptureId) -> Result<bool> {
        if !self.selection_mode {
            return Err(MoodcamError::SelectionModeInactive);
        }
        let item = self
            .items
            .iter_mut()
            .find(|item| item.capture.id() == id)
            .ok_or(MoodcamError::UnknownCapture(id))?;
        item.selected = !item.selected;
        Ok(item.selected)
    }

    pub fn selected_ids(&self) -> Vec<CaptureId> {
        self.items
            .iter()
            .filter(|item| item.selected)
            .map(|item| item.capture.id())
            .collect()
    }

    /// Zooms outside selection mode, toggles selection inside it
    pub fn activate(&mut self, id: CaptureId) -> Result<Activation> {
        if self.selection_mode {
            let selected = self.toggle_select(id)?;
            return Ok(Activation::Toggled { id, selected });
        }
        self.items
            .iter()
            .find(|item| item.capture.id() == id)
            .map(|item| Activation::Zoom(item.capture.image_png().to_vec()))
            .ok_or(MoodcamError::UnknownCapture(id))
    }

    /// Deletes every selected capture in one backend call.
    ///
    /// Local items are removed only after the backend succeeds; a failure
    /// leaves the gallery untouched.
    pub async fn delete_selected(
        &mut self,
        store: &CaptureStore,
        notifier: &dyn Notifier,
    ) -> Result<DeleteReport> {
        let ids = self.selected_ids();
        if ids.is_empty() {
            notifier.notify(Notice::info("No captures selected"));
            return Ok(DeleteReport::NothingSelected);
        }

        match store.delete(&ids).await {
            Ok(outcome) => {
                self.items.retain(|item| !ids.contains(&item.capture.id()));
                info!("Deleted {} capture(s)", outcome.deleted_count);
                notifier.notify(Notice::success(outcome.message.clone()));
                Ok(DeleteReport::Deleted(outcome))
            }
            Err(e) => {
                error!("Failed to delete captures: {}", e);
                notifier.notify(Notice::error(format!("Failed to delete captures: {e}")));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::aggregate;
    use crate::models::ExpressionVector;
    use chrono::Utc;

    fn capture(id: CaptureId, happy: f32, sad: f32) -> Capture {
        let vector = ExpressionVector::new()
            .with(Emotion::Happy, happy)
            .with(Emotion::Sad, sad);
        Capture::new(id, vec![id as u8], Some(aggregate(&[vector])), Utc::now())
    }

    #[test]
    fn label_filter_sorts_by_score_and_drops_zero_and_null() {
        let mut gallery = Gallery::from_captures(vec![
            capture(1, 0.5, 0.2),
            Capture::new(2, vec![], None, Utc::now()),
            capture(3, 0.9, 0.0),
            capture(4, 0.1, 0.6),
            capture(5, 0.3, 0.2),
        ]);
        gallery.set_filter(Filter::Label(Emotion::Sad));
        let ids: Vec<CaptureId> = gallery.view().iter().map(|i| i.capture.id()).collect();
        assert_eq!(ids, vec![4, 1, 5]);

        gallery.set_filter(Filter::All);
        assert_eq!(gallery.view().len(), 5);
    }

    #[test]
    fn available_filters_follow_enum_order() {
        let gallery = Gallery::from_captures(vec![capture(1, 0.0, 0.4), capture(2, 0.2, 0.0)]);
        assert_eq!(
            gallery.available_filters(),
            vec![
                Filter::All,
                Filter::Label(Emotion::Happy),
                Filter::Label(Emotion::Sad)
            ]
        );
    }

    #[test]
    fn selection_requires_selection_mode() {
        let mut gallery = Gallery::from_captures(vec![capture(1, 0.5, 0.0)]);
        assert!(matches!(
            gallery.toggle_select(1),
            Err(MoodcamError::SelectionModeInactive)
        ));
        gallery.toggle_selection_mode();
        assert!(matches!(
            gallery.toggle_select(99),
            Err(MoodcamError::UnknownCapture(99))
        ));
        assert!(gallery.toggle_select(1).unwrap());
        assert!(!gallery.toggle_select(1).unwrap());
    }

    #[test]
    fn leaving_selection_mode_clears_flags_only() {
        let original = vec![capture(1, 0.5, 0.0), capture(2, 0.1, 0.3)];
        let mut gallery = Gallery::from_captures(original.clone());
        gallery.toggle_selection_mode();
        gallery.toggle_select(1).unwrap();
        gallery.toggle_select(2).unwrap();

        assert!(!gallery.toggle_selection_mode());
        assert!(gallery.items().iter().all(|item| !item.selected));
        let kept: Vec<Capture> = gallery.items().iter().map(|i| i.capture.clone()).collect();
        assert_eq!(kept, original);
    }

    #[test]
    fn activate_zooms_or_toggles() {
        let mut gallery = Gallery::from_captures(vec![capture(7, 0.5, 0.0)]);
        assert_eq!(gallery.activate(7).unwrap(), Activation::Zoom(vec![7]));

        gallery.toggle_selection_mode();
        assert_eq!(
            gallery.activate(7).unwrap(),
            Activation::Toggled { id: 7, selected: true }
        );
        assert_eq!(gallery.selected_ids(), vec![7]);
    }

    #[test]
    fn filters_parse_case_insensitively() {
        assert_eq!("all".parse::<Filter>().unwrap(), Filter::All);
        assert_eq!("SAD".parse::<Filter>().unwrap(), Filter::Label(Emotion::Sad));
        assert!("fearful".parse::<Filter>().is_err());
    }
}
