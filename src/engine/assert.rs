//! The assert_screen state machine.
//!
//! Arming stores the candidate needles and a wall-clock deadline; the
//! runner polls with `check_asserted_screen`. Polls adapt their cost:
//! most passes search a 0.02 slice of the needle list, every fifth
//! deadline-second and the final post-deadline pass search everything.
//! Failed full-search frames are sampled (visually distinct ones only)
//! so a timeout can report a compact film strip of what the screen
//! actually did.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::capture::STALL_FACTOR;
use super::Engine;
use crate::command::{MustMatch, TagOrNeedle};
use crate::image::ImageRef;
use crate::needle::Needle;

/// Full needle-list search every this many deadline-seconds.
const FULL_SEARCH_PERIOD_SECS: i64 = 5;
/// Slice of the needle list tried on cheap polls.
const PARTIAL_SEARCH_RATIO: f64 = 0.02;
/// Soft cap on collected failure frames; overflow reduces to the hard
/// target below.
const FAILS_SOFT_CAP: usize = 60;
const FAILS_REDUCED: usize = 20;
/// A candidate failure frame is kept only if it is at least this
/// dissimilar to the previously kept one.
const DISTINCT_FAILURE_SIM: i64 = 30;
/// After reduction, the very last mismatch is re-appended if it differs
/// from the surviving tail by less than this.
const TAIL_DEDUP_SIM: i64 = 50;
/// Stored similarity of the sentinel frame pushed at timeout.
const SENTINEL_SIM: i64 = 1000;

/// One sampled mismatch during an active assertion.
#[derive(Clone)]
pub struct FailedMatch {
    pub frame: ImageRef,
    pub candidates: Vec<Value>,
    /// Seconds of assertion time that remained at capture. Larger means
    /// earlier; the timeout sentinel carries 0.
    pub age: i64,
    /// Similarity to the previously kept failure frame.
    pub similarity: i64,
    pub filename: String,
}

/// Present iff an assertion is in progress. At most one per engine.
pub struct AssertionArming {
    pub needles: Vec<Arc<Needle>>,
    /// Normalized, deduplicated, sorted atoms that produced `needles`;
    /// reload events re-expand from these.
    pub tags: Vec<String>,
    pub mustmatch_id: String,
    pub deadline: Instant,
    /// `(filename, search_ratio)` of the last attempted match.
    pub last_check: Option<(String, f64)>,
    pub fails: Vec<FailedMatch>,
    pub stall_detected: bool,
    pub reload_needles: bool,
}

impl Engine {
    /// Arm an assertion. Returns the normalized tag list for the
    /// runner's log.
    pub fn set_tags_to_assert(
        &mut self,
        mustmatch: Option<MustMatch>,
        timeout: Option<f64>,
        reload_needles: bool,
    ) -> Result<Vec<String>> {
        let mut atoms: Vec<String> = Vec::new();
        let mut direct: Vec<Arc<Needle>> = Vec::new();
        match mustmatch {
            None => {}
            Some(MustMatch::One(tag)) => atoms.push(tag),
            Some(MustMatch::Many(items)) => {
                for item in items {
                    match item {
                        TagOrNeedle::Tag(tag) => atoms.push(tag),
                        TagOrNeedle::Needle { name } => {
                            match self.needles.find_name(&name) {
                                Some(needle) => direct.push(needle),
                                None => {
                                    eprintln!("  WARN: unknown needle '{}' in mustmatch", name)
                                }
                            }
                            atoms.push(name);
                        }
                    }
                }
            }
        }
        atoms.sort();
        atoms.dedup();

        let mut candidates = direct;
        for needle in self.needles.expand(&atoms) {
            if !candidates.iter().any(|c| c.name == needle.name) {
                candidates.push(needle);
            }
        }

        let mustmatch_id = atoms.join("_");
        if candidates.is_empty() {
            // arm anyway; the assertion will run its course and time out
            eprintln!(
                "  WARN: no needles for '{}', assertion cannot match",
                mustmatch_id
            );
        }
        if self.arming.is_some() {
            eprintln!("  WARN: superseding an active assertion arming");
        }

        let timeout = timeout
            .map(|t| Duration::from_secs_f64(t.max(0.0)))
            .unwrap_or(self.cfg.default_timeout);
        self.arming = Some(AssertionArming {
            needles: candidates,
            tags: atoms.clone(),
            mustmatch_id,
            deadline: Instant::now() + timeout,
            last_check: None,
            fails: Vec::new(),
            stall_detected: false,
            reload_needles,
        });
        Ok(atoms)
    }

    /// One runner poll of the armed assertion.
    ///
    /// Returns JSON null while the assertion is still pending; a match,
    /// timeout or waiting_for_needle object is terminal for this poll
    /// (match and timeout also disarm).
    pub fn check_asserted_screen(&mut self) -> Result<Value> {
        let (img, filename) = match (&self.last_image, &self.last_screenshot_name) {
            (Some(i), Some(f)) => (i.clone(), f.clone()),
            _ => return Ok(Value::Null),
        };
        let mut arming = match self.arming.take() {
            Some(a) => a,
            None => return Ok(Value::Null),
        };

        let n = seconds_to_deadline(arming.deadline, Instant::now());
        let ratio = if n < 0 || n % FULL_SEARCH_PERIOD_SECS == 0 {
            1.0
        } else {
            PARTIAL_SEARCH_RATIO
        };

        // nothing new since the last attempt and no stronger search
        // coming - skip. Never skipped past the deadline: the final
        // exhaustive pass below must run exactly once.
        if n >= 0 {
            if let Some((last_file, last_ratio)) = &arming.last_check {
                if *last_file == filename && *last_ratio >= ratio {
                    self.arming = Some(arming);
                    return Ok(Value::Null);
                }
            }
        }

        let (found, candidates) = img.search(&arming.needles, 0.0, ratio);

        // a human raised the stop signal: park the SUT and hand over,
        // still armed - the runner drives the next step
        if self.interactive_mode && self.control.stop_present() && !arming.reload_needles {
            self.driver.freeze()?;
            let rsp = json!({
                "waiting_for_needle": true,
                "filename": filename,
                "candidates": candidates,
            });
            self.arming = Some(arming);
            return Ok(rsp);
        }

        if let Some(found) = found {
            if self.control.continue_present() {
                self.control.remove_continue()?;
            }
            eprintln!(
                "  assert_screen: '{}' matched on {}",
                arming.mustmatch_id, filename
            );
            // arming dropped here: disarmed
            return Ok(json!({
                "filename": filename,
                "found": found,
                "candidates": candidates,
            }));
        }

        if n < 0 {
            return self.assert_screen_timeout(arming, img, candidates, filename);
        }

        // sample visually distinct failure frames from full searches
        if ratio >= 1.0 {
            let sim = match arming.fails.last() {
                Some(last) if n > 0 => last.frame.similarity(&img) as i64,
                _ => DISTINCT_FAILURE_SIM - 1,
            };
            if sim < DISTINCT_FAILURE_SIM {
                arming.fails.push(FailedMatch {
                    frame: img,
                    candidates,
                    age: n,
                    similarity: sim,
                    filename: filename.clone(),
                });
            }
            if arming.fails.len() > FAILS_SOFT_CAP {
                reduce_to_biggest_changes(&mut arming.fails, FAILS_REDUCED);
            }
        }

        arming.last_check = Some((filename, ratio));
        self.arming = Some(arming);
        Ok(Value::Null)
    }

    fn assert_screen_timeout(
        &mut self,
        mut arming: AssertionArming,
        img: ImageRef,
        candidates: Vec<Value>,
        filename: String,
    ) -> Result<Value> {
        // interactive runs freeze instead of failing, until the runner
        // signals continue
        if self.interactive_mode && !self.control.continue_present() {
            if !self.control.stop_present() {
                self.control.create_stop()?;
            }
            self.driver.freeze()?;
            let rsp = json!({
                "waiting_for_needle": true,
                "filename": filename,
                "candidates": candidates,
            });
            self.arming = Some(arming);
            return Ok(rsp);
        }

        if arming.stall_detected {
            let msg = format!(
                "assert_screen: '{}' timed out on a stalled console \
                 (no new frames for {}x the screenshot interval)",
                arming.mustmatch_id, STALL_FACTOR
            );
            let _ = std::fs::write(self.cfg.crash_file(), &msg);
            // fatal: the crash hook stops the VM and closes the pipes
            bail!(msg);
        }

        eprintln!(
            "  WARN: assert_screen: '{}' timed out",
            arming.mustmatch_id
        );
        arming.fails.push(FailedMatch {
            frame: img,
            candidates,
            age: 0,
            similarity: SENTINEL_SIM,
            filename,
        });
        let failed_screens = failed_screens_to_json(&mut arming.fails);
        // arming dropped here: disarmed
        Ok(json!({ "timeout": true, "failed_screens": failed_screens }))
    }

    /// Force the armed assertion onto its timeout path: the next poll
    /// runs the final exhaustive search and reports.
    pub fn stop_assert_screen(&mut self) {
        if let Some(arming) = self.arming.as_mut() {
            arming.deadline = Instant::now();
        }
    }

    /// Continue a frozen interactive assertion: resume the SUT, push
    /// the deadline out, optionally reload the needle database and
    /// re-expand the candidate list from the stored tags.
    pub fn retry_assert_screen(
        &mut self,
        reload_needles: bool,
        timeout: Option<f64>,
    ) -> Result<()> {
        if reload_needles {
            self.needles.reload()?;
        }
        self.driver.cont()?;
        let timeout = timeout
            .map(|t| Duration::from_secs_f64(t.max(0.0)))
            .unwrap_or(self.cfg.default_timeout);
        match self.arming.as_mut() {
            Some(arming) => {
                if reload_needles {
                    arming.needles = self.needles.expand(&arming.tags);
                }
                arming.reload_needles = reload_needles;
                arming.deadline = Instant::now() + timeout;
                arming.stall_detected = false;
                arming.last_check = None;
            }
            None => eprintln!("  WARN: retry_assert_screen without an armed assertion"),
        }
        Ok(())
    }
}

/// Integer seconds until the deadline; negative once it has passed.
fn seconds_to_deadline(deadline: Instant, now: Instant) -> i64 {
    if now < deadline {
        deadline.duration_since(now).as_secs() as i64
    } else {
        -(now.duration_since(deadline).as_secs() as i64) - 1
    }
}

/// Shrink `fails` to `limit` + 1 entries, keeping the earliest failure
/// unconditionally and otherwise the frames that most distinguished
/// themselves from their predecessor (smallest stored similarity).
pub(crate) fn reduce_to_biggest_changes(fails: &mut Vec<FailedMatch>, limit: usize) {
    if fails.len() <= limit {
        return;
    }
    let first = fails.remove(0);
    fails.sort_by_key(|f| f.similarity);
    fails.truncate(limit);
    fails.insert(0, first);
    // back into capture order: most time remaining first
    fails.sort_by(|a, b| b.age.cmp(&a.age));
    // stored similarities are against the OLD predecessors; recompute
    for i in 1..fails.len() {
        fails[i].similarity = fails[i - 1].frame.similarity(&fails[i].frame) as i64;
    }
}

/// Final failure summary for the timeout response.
fn failed_screens_to_json(fails: &mut Vec<FailedMatch>) -> Vec<Value> {
    let final_mismatch = fails.last().cloned();
    if fails.len() > FAILS_REDUCED {
        reduce_to_biggest_changes(fails, FAILS_REDUCED);
        // the most recent mismatch is what the screen looked like when
        // time ran out; bring it back if reduction dropped it and it
        // differs from the surviving tail
        if let Some(fin) = final_mismatch {
            let dropped = fails
                .last()
                .map(|t| t.filename != fin.filename)
                .unwrap_or(true);
            let distinct = fails
                .last()
                .map(|t| (t.frame.similarity(&fin.frame) as i64) < TAIL_DEDUP_SIM)
                .unwrap_or(true);
            if dropped && distinct {
                fails.push(fin);
            }
        }
    }
    fails
        .iter()
        .map(|f| {
            json!({
                "filename": f.filename,
                "candidates": f.candidates,
                "similarity": f.similarity,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame(shade: u8) -> ImageRef {
        ImageRef::from(RgbImage::from_pixel(16, 16, Rgb([shade, shade, shade])))
    }

    fn fail(age: i64, similarity: i64, name: &str) -> FailedMatch {
        FailedMatch {
            frame: frame((age % 256) as u8),
            candidates: Vec::new(),
            age,
            similarity,
            filename: name.to_string(),
        }
    }

    #[test]
    fn reducer_is_noop_under_limit() {
        let mut fails: Vec<FailedMatch> =
            (0..10).map(|i| fail(100 - i, i * 10, &format!("f{i}"))).collect();
        reduce_to_biggest_changes(&mut fails, 20);
        assert_eq!(fails.len(), 10);
    }

    #[test]
    fn reducer_bounds_and_keeps_first() {
        let mut fails: Vec<FailedMatch> =
            (0..70).map(|i| fail(200 - i, i * 7, &format!("f{i}"))).collect();
        reduce_to_biggest_changes(&mut fails, 20);
        assert_eq!(fails.len(), 21);
        // the earliest failure survives unconditionally
        assert!(fails.iter().any(|f| f.filename == "f0"));
    }

    #[test]
    fn reducer_keeps_most_distinct_frames() {
        // low stored similarity = frame stood out from its predecessor
        let mut fails: Vec<FailedMatch> = Vec::new();
        for i in 0..30i64 {
            // entries f1..f9 very distinct, the rest near-identical
            let sim = if (1..10).contains(&i) { i } else { 5000 + i };
            fails.push(fail(300 - i, sim, &format!("f{i}")));
        }
        reduce_to_biggest_changes(&mut fails, 9);
        let names: Vec<&str> = fails.iter().map(|f| f.filename.as_str()).collect();
        for i in 1..10 {
            let name = format!("f{i}");
            assert!(names.contains(&name.as_str()), "expected {name} kept");
        }
    }

    #[test]
    fn reducer_restores_capture_order() {
        let mut fails: Vec<FailedMatch> =
            (0..70).map(|i| fail(500 - i, i, &format!("f{i}"))).collect();
        reduce_to_biggest_changes(&mut fails, 20);
        for pair in fails.windows(2) {
            assert!(pair[0].age >= pair[1].age);
        }
    }

    #[test]
    fn summary_reappends_dropped_final_mismatch() {
        // final entry has a huge similarity score, so reduction drops
        // it; its frame differs from everything else, so it comes back
        let mut fails: Vec<FailedMatch> = (0..30)
            .map(|i| {
                let mut f = fail(300 - i, i, &format!("f{i}"));
                f.frame = frame(0);
                f
            })
            .collect();
        let mut last = fail(0, 9999, "final");
        last.frame = frame(255);
        fails.push(last);

        let summary = failed_screens_to_json(&mut fails);
        assert!(summary.len() <= 22);
        let last_name = summary
            .last()
            .and_then(|v| v.get("filename"))
            .and_then(|v| v.as_str())
            .unwrap();
        assert_eq!(last_name, "final");
    }

    #[test]
    fn deadline_seconds_go_negative_after_expiry() {
        let now = Instant::now();
        assert_eq!(seconds_to_deadline(now + Duration::from_secs(7), now), 7);
        assert_eq!(seconds_to_deadline(now, now), -1);
        assert_eq!(
            seconds_to_deadline(now, now + Duration::from_millis(100)),
            -1
        );
        assert_eq!(
            seconds_to_deadline(now, now + Duration::from_secs(2)),
            -3
        );
    }
}
