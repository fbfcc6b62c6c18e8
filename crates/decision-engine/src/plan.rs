//! Observation plan: contiguous ON/OFF intervals from transition windows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::{Mode, Result, Window};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub mode: Mode,
    pub t_start: DateTime<Utc>,
    pub t_end: DateTime<Utc>,
    pub duration_sec: f64,
    pub reason: String,
}

/// Context written next to every exported plan row.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanProvenance {
    pub norad_id: Option<u32>,
    pub tle_epoch: Option<DateTime<Utc>>,
    pub percentile: String,
    pub flux_model: String,
    pub track_step_sec: i64,
}

fn item(mode: Mode, t_start: DateTime<Utc>, t_end: DateTime<Utc>, reason: &str) -> PlanItem {
    PlanItem {
        mode,
        t_start,
        t_end,
        duration_sec: (t_end - t_start).num_milliseconds() as f64 / 1000.0,
        reason: reason.to_string(),
    }
}

/// Split `[start, end]` at every window start inside the range.
///
/// Windows starting at or before `start` set the opening mode; those after
/// `end` are ignored. Each item carries the reason of the command that
/// opened it (`initial` for the opening item when nothing precedes it).
pub fn build_plan(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    windows: &[Window],
    initial_mode: Mode,
) -> Vec<PlanItem> {
    let mut commands: Vec<&Window> = windows.iter().collect();
    commands.sort_by_key(|w| w.t_start);

    let mut mode = initial_mode;
    let mut reason = "initial";
    for w in commands.iter().take_while(|w| w.t_start <= start) {
        mode = w.mode;
        reason = &w.reason;
    }

    let mut items = Vec::new();
    let mut current_start = start;
    for w in commands
        .iter()
        .skip_while(|w| w.t_start <= start)
        .take_while(|w| w.t_start <= end)
    {
        if w.t_start > current_start {
            items.push(item(mode, current_start, w.t_start, reason));
        }
        mode = w.mode;
        current_start = w.t_start;
        reason = &w.reason;
    }

    if current_start < end {
        items.push(item(mode, current_start, end, reason));
    }
    items
}

fn iso_z(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Write the ON items of `items` as CSV with a header row.
pub fn write_plan_csv<W: Write>(
    writer: W,
    items: &[PlanItem],
    provenance: &PlanProvenance,
) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record([
        "mode",
        "on_utc",
        "off_utc",
        "duration_sec",
        "reason",
        "norad_id",
        "tle_epoch_utc",
        "percentile",
        "flux_model",
        "track_step_sec",
    ])?;

    let norad = provenance.norad_id.map(|n| n.to_string()).unwrap_or_default();
    let epoch = provenance.tle_epoch.as_ref().map(iso_z).unwrap_or_default();
    let step = provenance.track_step_sec.to_string();

    for item in items.iter().filter(|i| i.mode == Mode::ObsOn) {
        let mode = item.mode.to_string();
        let on = iso_z(&item.t_start);
        let off = iso_z(&item.t_end);
        let duration = format!("{:.0}", item.duration_sec);
        let row: [&str; 10] = [
            &mode,
            &on,
            &off,
            &duration,
            &item.reason,
            &norad,
            &epoch,
            &provenance.percentile,
            &provenance.flux_model,
            &step,
        ];
        csv.write_record(row)?;
    }
    csv.flush()?;
    Ok(())
}
