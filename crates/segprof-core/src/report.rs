//! Textual and JSON rendering of a [`ProfilePass`].

use crate::pass::ProfilePass;
use crate::recorder::{BackendStats, Segment, SegmentKind};
use segprof_api::{BackendId, UnitId};
use segprof_time::as_millis_f64 as ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportOptions {
    /// Up to this many compiled segments the full sequence is shown.
    pub threshold: usize,
    /// Units listed in the aggregated view.
    pub top_n: usize,
    /// Always show the full sequence.
    pub verbose: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            threshold: 3,
            top_n: 3,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportView {
    Sequential,
    Aggregated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRow {
    pub backend: BackendId,
    pub runs: u64,
    pub mean_ms: f64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub label: String,
    pub unit: Option<UnitId>,
    pub runs: Option<u64>,
    pub mean_ms: Option<f64>,
    pub failures: Option<u64>,
    pub backends: Vec<BackendRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateFooter {
    pub shown: usize,
    pub graphs_compiled: usize,
    pub compiled_segments_run: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendTotal {
    pub backend: BackendId,
    pub compiled_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportTotals {
    pub local_ms: f64,
    pub backends: Vec<BackendTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedReport {
    pub view: ReportView,
    pub rows: Vec<ReportRow>,
    pub footer: Option<AggregateFooter>,
    pub totals: ReportTotals,
    pub discarded_runs: u64,
    pub calls: u64,
}

impl RenderedReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub fn report(pass: &ProfilePass, verbose: bool) -> RenderedReport {
    render(
        pass,
        &ReportOptions {
            verbose,
            ..ReportOptions::default()
        },
    )
}

pub fn render(pass: &ProfilePass, options: &ReportOptions) -> RenderedReport {
    let sequential = options.verbose || pass.compiled_segment_count() <= options.threshold;
    let (view, rows, footer) = if sequential {
        (ReportView::Sequential, sequential_rows(pass), None)
    } else {
        let (rows, footer) = aggregated_rows(pass, options.top_n);
        (ReportView::Aggregated, rows, Some(footer))
    };
    RenderedReport {
        view,
        rows,
        footer,
        totals: totals(pass),
        discarded_runs: pass.discarded_runs(),
        calls: pass.calls(),
    }
}

fn backend_rows(stats: &[BackendStats]) -> Vec<BackendRow> {
    stats
        .iter()
        .map(|b| BackendRow {
            backend: b.backend,
            runs: b.runs,
            mean_ms: ms(b.mean()),
            failures: b.failures,
        })
        .collect()
}

fn sequential_rows(pass: &ProfilePass) -> Vec<ReportRow> {
    pass.segments()
        .iter()
        .map(|segment| match &segment.kind {
            SegmentKind::Uncompiled(local) => ReportRow {
                label: "Uncompiled".to_string(),
                unit: None,
                runs: Some(local.runs),
                mean_ms: Some(ms(local.mean())),
                failures: None,
                backends: Vec::new(),
            },
            SegmentKind::Compiled { unit, backends, .. } => ReportRow {
                label: unit.to_string(),
                unit: Some(*unit),
                runs: None,
                mean_ms: None,
                failures: None,
                backends: backend_rows(backends),
            },
        })
        .collect()
}

struct UnitGroup {
    unit: UnitId,
    time: Duration,
    backends: Vec<BackendStats>,
}

fn aggregated_rows(pass: &ProfilePass, top_n: usize) -> (Vec<ReportRow>, AggregateFooter) {
    let mut groups: BTreeMap<UnitId, UnitGroup> = BTreeMap::new();
    for segment in pass.compiled_segments() {
        let SegmentKind::Compiled { unit, backends, .. } = &segment.kind else {
            continue;
        };
        let group = groups.entry(*unit).or_insert_with(|| UnitGroup {
            unit: *unit,
            time: Duration::ZERO,
            backends: Vec::new(),
        });
        group.time += segment.duration();
        for stats in backends {
            match group.backends.iter_mut().find(|b| b.backend == stats.backend) {
                Some(existing) => existing.absorb(stats),
                None => group.backends.push(stats.clone()),
            }
        }
    }

    let mut ranked: Vec<UnitGroup> = groups.into_values().collect();
    ranked.sort_by(|a, b| b.time.cmp(&a.time).then(a.unit.cmp(&b.unit)));
    let graphs_compiled = ranked.len();
    ranked.truncate(top_n);

    let local: Vec<&Segment> = pass.segments().iter().filter(|s| !s.is_compiled()).collect();
    let mut rows = Vec::with_capacity(ranked.len() + 1);
    if !local.is_empty() {
        let runs = local
            .iter()
            .map(|s| match &s.kind {
                SegmentKind::Uncompiled(l) => l.runs,
                SegmentKind::Compiled { .. } => 0,
            })
            .sum();
        rows.push(ReportRow {
            label: format!("Uncompiled ({} segments)", local.len()),
            unit: None,
            runs: Some(runs),
            mean_ms: Some(ms(pass.total_uncompiled())),
            failures: None,
            backends: Vec::new(),
        });
    }
    for group in &ranked {
        rows.push(ReportRow {
            label: group.unit.to_string(),
            unit: Some(group.unit),
            runs: None,
            mean_ms: None,
            failures: None,
            backends: backend_rows(&group.backends),
        });
    }

    let footer = AggregateFooter {
        shown: ranked.len(),
        graphs_compiled,
        compiled_segments_run: pass.compiled_segment_runs(),
    };
    (rows, footer)
}

fn totals(pass: &ProfilePass) -> ReportTotals {
    let local = pass.total_uncompiled();
    ReportTotals {
        local_ms: ms(local),
        backends: pass
            .backend_totals()
            .into_iter()
            .map(|(backend, compiled)| BackendTotal {
                backend,
                compiled_ms: ms(compiled),
                total_ms: ms(local + compiled),
            })
            .collect(),
    }
}

const HEADERS: [&str; 4] = ["Segment", "Runs", "Mean ms", "Failures"];

fn write_row(f: &mut fmt::Formatter<'_>, widths: &[usize; 4], cells: [&str; 4]) -> fmt::Result {
    writeln!(
        f,
        "{:<w0$} | {:>w1$} | {:>w2$} | {:>w3$}",
        cells[0],
        cells[1],
        cells[2],
        cells[3],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3]
    )
}

impl fmt::Display for RenderedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<[String; 4]> = Vec::new();
        let opt = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_default();
        for row in &self.rows {
            lines.push([
                row.label.clone(),
                opt(row.runs),
                row.mean_ms.map(|m| format!("{m:.3}")).unwrap_or_default(),
                opt(row.failures),
            ]);
            for b in &row.backends {
                lines.push([
                    format!("  {}", b.backend),
                    b.runs.to_string(),
                    format!("{:.3}", b.mean_ms),
                    b.failures.to_string(),
                ]);
            }
        }

        let mut widths = HEADERS.map(str::len);
        for line in &lines {
            for (w, cell) in widths.iter_mut().zip(line.iter()) {
                *w = (*w).max(cell.len());
            }
        }
        let divider = widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let pad = if i == 0 || i == widths.len() - 1 { 1 } else { 2 };
                "-".repeat(w + pad)
            })
            .collect::<Vec<_>>()
            .join("+");

        if self.discarded_runs > 0 {
            writeln!(f, "Compilation runs discarded: {}", self.discarded_runs)?;
        }
        write_row(f, &widths, HEADERS)?;
        writeln!(f, "{divider}")?;
        for line in &lines {
            write_row(f, &widths, [&line[0], &line[1], &line[2], &line[3]])?;
        }

        if let Some(footer) = &self.footer {
            writeln!(
                f,
                "Top {} of {} compiled graphs shown; compiled segments run: {}",
                footer.shown, footer.graphs_compiled, footer.compiled_segments_run
            )?;
        }
        writeln!(f, "Totals over {} call(s):", self.calls)?;
        writeln!(f, "  local (uncompiled): {:.3} ms", self.totals.local_ms)?;
        for total in &self.totals.backends {
            writeln!(
                f,
                "  {} ({}): {:.3} ms compiled, {:.3} ms total",
                total.backend,
                total.backend.hardware.description(),
                total.compiled_ms,
                total.total_ms
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::SegmentRecorder;
    use segprof_api::{BackendOutcome, BACKEND_CATALOG};

    const CPU: BackendId = BACKEND_CATALOG[0];
    const GPU: BackendId = BACKEND_CATALOG[1];

    fn millis(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// One call running `units` in order, each separated by 1 ms of local time.
    fn pass_with_units(units: &[(u32, u64)]) -> ProfilePass {
        let mut rec = SegmentRecorder::new();
        rec.begin_call().unwrap();
        for &(unit, cost) in units {
            rec.record_uncompiled(millis(1)).unwrap();
            let h = rec.begin_unit(UnitId(unit)).unwrap();
            rec.end_unit(
                h,
                &[
                    BackendOutcome::success(CPU, millis(cost)),
                    BackendOutcome::success(GPU, millis(cost / 2)),
                ],
            )
            .unwrap();
        }
        rec.end_call().unwrap();
        let (segments, calls) = rec.finalize();
        ProfilePass::new(segments, vec![CPU, GPU], calls, 0, 0)
    }

    fn normalized(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn few_compiled_segments_render_sequentially() {
        let pass = pass_with_units(&[(1, 10), (2, 4)]);
        let rendered = report(&pass, false);
        assert_eq!(rendered.view, ReportView::Sequential);
        assert_eq!(rendered.rows.len(), 4);
        assert_eq!(rendered.rows[1].label, "Graph #1");
        assert_eq!(rendered.rows[1].backends[0].mean_ms, 10.0);
        assert!(rendered.footer.is_none());

        let text = rendered.to_string();
        assert!(normalized(&text).starts_with("Segment | Runs | Mean ms | Failures"));
        assert!(text.contains("  r6i.large/onnxrt-cpu"));
        assert!(text.contains(
            "g4dn.xlarge/onnxrt-cuda (Nvidia T4): 7.000 ms compiled, 9.000 ms total"
        ));
        assert!(!text.contains("Compilation runs discarded"));
    }

    #[test]
    fn discarded_runs_lead_the_report() {
        let mut rec = SegmentRecorder::new();
        for _ in 0..3 {
            rec.begin_call().unwrap();
            let first = rec.segments().is_empty();
            let h = rec.begin_unit(UnitId(1)).unwrap();
            let outcomes = if first {
                vec![
                    BackendOutcome::compilation_run(CPU),
                    BackendOutcome::compilation_run(GPU),
                ]
            } else {
                vec![
                    BackendOutcome::success(CPU, millis(4)),
                    BackendOutcome::success(GPU, millis(2)),
                ]
            };
            rec.end_unit(h, &outcomes).unwrap();
            rec.end_call().unwrap();
        }
        let (segments, calls) = rec.finalize();
        let pass = ProfilePass::new(segments, vec![CPU, GPU], calls, 0, 0);
        let rendered = report(&pass, false);
        assert_eq!(rendered.discarded_runs, 1);

        let text = rendered.to_string();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Compilation runs discarded: 1"));
        assert!(normalized(lines.next().unwrap()).starts_with("Segment | Runs"));
    }

    #[test]
    fn dense_passes_aggregate_to_top_units() {
        let units: Vec<(u32, u64)> = (1..=9).map(|u| (u, u as u64 * 2)).collect();
        let pass = pass_with_units(&units);
        let rendered = report(&pass, false);
        assert_eq!(rendered.view, ReportView::Aggregated);
        let labels: Vec<_> = rendered.rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(
            labels,
            ["Uncompiled (9 segments)", "Graph #9", "Graph #8", "Graph #7"]
        );
        assert_eq!(
            rendered.footer,
            Some(AggregateFooter {
                shown: 3,
                graphs_compiled: 9,
                compiled_segments_run: 9,
            })
        );
        assert!(rendered
            .to_string()
            .contains("Top 3 of 9 compiled graphs shown; compiled segments run: 9"));
    }

    #[test]
    fn verbose_forces_the_full_sequence() {
        let units: Vec<(u32, u64)> = (1..=5).map(|u| (u, 2)).collect();
        let pass = pass_with_units(&units);
        assert_eq!(report(&pass, false).view, ReportView::Aggregated);
        let full = report(&pass, true);
        assert_eq!(full.view, ReportView::Sequential);
        assert_eq!(full.rows.len(), 10);
    }

    #[test]
    fn threshold_counts_compiled_slots() {
        let pass = pass_with_units(&[(1, 2), (2, 2), (3, 2)]);
        assert_eq!(report(&pass, false).view, ReportView::Sequential);
        let strict = render(
            &pass,
            &ReportOptions {
                threshold: 2,
                ..ReportOptions::default()
            },
        );
        assert_eq!(strict.view, ReportView::Aggregated);
    }

    #[test]
    fn aggregated_totals_match_sequential_totals() {
        let units: Vec<(u32, u64)> = [3, 1, 3, 2, 1, 3].iter().map(|&u| (u, 6)).collect();
        let pass = pass_with_units(&units);
        let aggregated = report(&pass, false);
        let sequential = report(&pass, true);
        assert_eq!(aggregated.totals, sequential.totals);
        assert_eq!(aggregated.totals.local_ms, 6.0);
        assert_eq!(aggregated.totals.backends[0].compiled_ms, 36.0);

        // unit 3 ran in three slots: runs sum, mean is weighted
        let top = &aggregated.rows[1];
        assert_eq!(top.unit, Some(UnitId(3)));
        assert_eq!(top.backends[0].runs, 3);
        assert_eq!(top.backends[0].mean_ms, 6.0);
    }

    #[test]
    fn json_export_carries_view_and_totals() {
        let pass = pass_with_units(&[(1, 4)]);
        let json: serde_json::Value =
            serde_json::from_str(&report(&pass, false).to_json().unwrap()).unwrap();
        assert_eq!(json["view"], "sequential");
        assert_eq!(json["rows"][1]["backends"][0]["backend"], "r6i.large/onnxrt-cpu");
        assert_eq!(json["totals"]["backends"][1]["total_ms"], 3.0);
    }
}
