//! Deterministic time-availability extraction from assignment posts.
//!
//! Replaces the LLM-provided `time_availability` when enabled. Output shape
//! is fixed: explicit and estimated day maps of `HH:MM-HH:MM` windows plus an
//! optional verbatim note.
//!
//! Policy, mirrored in the rules below:
//! - day-set keyword + concrete time ("weekdays at 7:30pm") is ESTIMATED;
//! - day ranges ("Mon-Fri") are ESTIMATED even with a concrete time;
//! - negation near a time ("No Sunday before 3pm") is not representable in
//!   the schema; the window is still emitted and a parse warning attached.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use tutorpipe_core::types::{Day, TimeAvailability};

/// Evidence span into the normalized text, kept for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedSpan {
    #[serde(rename = "type")]
    pub span_type: String,
    pub days: Vec<String>,
    pub original_substring: String,
    pub normalized_substring: String,
    pub start_idx: usize,
    pub end_idx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeMeta {
    pub matched_spans: Vec<MatchedSpan>,
    pub rules_fired: Vec<String>,
    pub parse_warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    ExplicitRange,
    ExplicitSingle,
    RelativeAfter,
    RelativeBefore,
    Fuzzy,
    Note,
}

#[derive(Debug, Clone)]
struct Event {
    kind: EventKind,
    window: Option<String>,
    span: (usize, usize),
}

impl Event {
    fn is_estimated_kind(&self) -> bool {
        matches!(
            self.kind,
            EventKind::RelativeAfter | EventKind::RelativeBefore | EventKind::Fuzzy
        )
    }
}

#[derive(Debug, Clone, Default)]
struct DayInfo {
    days: Vec<Day>,
    broad: bool,
    ranged: bool,
}

// --- time token parsing ----------------------------------------------------

static T24_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,2}):(\d{2})$").unwrap());
static TAMPM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})(?::(\d{2}))?([ap]m)$").unwrap());
static TCOMPACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{3,4})([ap]m)?$").unwrap());

fn hour12_to_24(h: u32, meridiem: &str) -> Option<u32> {
    if !(1..=12).contains(&h) {
        return None;
    }
    Some(match (h, meridiem) {
        (12, "am") => 0,
        (h, "am") => h,
        (12, "pm") => 12,
        (h, "pm") => h + 12,
        _ => return None,
    })
}

/// Parse one time token into (hour24, minute).
///
/// Accepts `7pm`, `7:30pm`, `19:30`, `730pm`, `1930`.
pub fn parse_time_token(token: &str) -> Option<(u32, u32)> {
    let s: String = token.trim().to_lowercase().replace(' ', "");
    if s.is_empty() {
        return None;
    }

    if let Some(c) = T24_RE.captures(&s) {
        let hh: u32 = c[1].parse().ok()?;
        let mm: u32 = c[2].parse().ok()?;
        return (hh <= 23 && mm <= 59).then_some((hh, mm));
    }

    if let Some(c) = TAMPM_RE.captures(&s) {
        let hh: u32 = c[1].parse().ok()?;
        let mm: u32 = c.get(2).map(|m| m.as_str().parse().ok()).unwrap_or(Some(0))?;
        if mm > 59 {
            return None;
        }
        return hour12_to_24(hh, &c[3]).map(|h| (h, mm));
    }

    if let Some(c) = TCOMPACT_RE.captures(&s) {
        let digits = &c[1];
        let (hh, mm): (u32, u32) = if digits.len() == 3 {
            (digits[..1].parse().ok()?, digits[1..].parse().ok()?)
        } else {
            (digits[..2].parse().ok()?, digits[2..].parse().ok()?)
        };
        if mm > 59 {
            return None;
        }
        return match c.get(2) {
            None => (hh <= 23).then_some((hh, mm)),
            Some(ap) => hour12_to_24(hh, ap.as_str()).map(|h| (h, mm)),
        };
    }

    None
}

fn hhmm(h: u32, m: u32) -> String {
    format!("{h:02}:{m:02}")
}

/// Build a window, refusing inverted ranges so every emitted slot satisfies
/// start <= end.
fn window(start: (u32, u32), end: (u32, u32)) -> Option<String> {
    if start > end {
        return None;
    }
    Some(format!("{}-{}", hhmm(start.0, start.1), hhmm(end.0, end.1)))
}

// --- day parsing -----------------------------------------------------------

const DAY_ALT: &str =
    r"mon(?:day)?s?|tue(?:s|sday)?s?|wed(?:s|nesday)?s?|thu(?:rs|rsday)?s?|fri(?:day)?s?|sat(?:urday)?s?|sun(?:day)?s?";

static DAY_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b({DAY_ALT})\b")).unwrap());
static DAY_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({DAY_ALT})\s*(?:-|to)\s*({DAY_ALT})\b")).unwrap()
});
static WEEKDAYS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bweekdays?\b").unwrap());
static WEEKENDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bweekends?\b").unwrap());
static ALL_DAYS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(daily|every\s*day|everyday|all\s+days)\b").unwrap());

fn canon_day_token(tok: &str) -> Option<Day> {
    let mut t = tok.trim().to_lowercase();
    if t.ends_with('s') {
        t.pop();
    }
    if t.starts_with("mon") {
        Some(Day::Monday)
    } else if t.starts_with("tue") {
        Some(Day::Tuesday)
    } else if t.starts_with("wed") {
        Some(Day::Wednesday)
    } else if t.starts_with("thu") {
        Some(Day::Thursday)
    } else if t.starts_with("fri") {
        Some(Day::Friday)
    } else if t.starts_with("sat") {
        Some(Day::Saturday)
    } else if t.starts_with("sun") {
        Some(Day::Sunday)
    } else {
        None
    }
}

fn expand_range(a: &str, b: &str) -> Vec<Day> {
    let (Some(da), Some(db)) = (canon_day_token(a), canon_day_token(b)) else {
        return Vec::new();
    };
    let (ia, ib) = (da.index(), db.index());
    if ia <= ib {
        Day::ALL[ia..=ib].to_vec()
    } else {
        // Wrap-around day ranges are ambiguous in this domain; refuse.
        Vec::new()
    }
}

fn extract_days(line: &str) -> DayInfo {
    let mut info = DayInfo::default();
    let mut push = |days: &mut Vec<Day>, d: Day| {
        if !days.contains(&d) {
            days.push(d);
        }
    };

    if ALL_DAYS_RE.is_match(line) {
        info.broad = true;
        for d in Day::ALL {
            push(&mut info.days, d);
        }
    }
    if WEEKDAYS_RE.is_match(line) {
        info.broad = true;
        for d in Day::WEEKDAYS {
            push(&mut info.days, d);
        }
    }
    if WEEKENDS_RE.is_match(line) {
        info.broad = true;
        for d in Day::WEEKEND {
            push(&mut info.days, d);
        }
    }

    for caps in DAY_RANGE_RE.captures_iter(line) {
        let expanded = expand_range(&caps[1], &caps[2]);
        if !expanded.is_empty() {
            info.ranged = true;
            for d in expanded {
                push(&mut info.days, d);
            }
        }
    }

    for caps in DAY_TOKEN_RE.captures_iter(line) {
        if let Some(d) = canon_day_token(&caps[1]) {
            push(&mut info.days, d);
        }
    }

    info.days.sort_by_key(|d| d.index());
    info
}

// --- in-line events --------------------------------------------------------

static RANGE_AMPM_AMPM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*([ap]m)\s*(?:-|to)\s*(\d{1,2})(?::(\d{2}))?\s*([ap]m)\b")
        .unwrap()
});
// "2-4pm", "2:30-5:30pm": the start inherits the end's meridiem.
static RANGE_AMPM_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(?:-|to)\s*(\d{1,2})(?::(\d{2}))?\s*([ap]m)\b")
        .unwrap()
});
static RANGE_COMPACT_AMPM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{3,4})\s*([ap]m)\s*(?:-|to)\s*(\d{3,4})\s*([ap]m)\b").unwrap()
});
static RANGE_24H_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2}):(\d{2})\s*(?:-|to)\s*(\d{1,2}):(\d{2})\b").unwrap());
// "7pm-9" (end inherits the start's meridiem)
static RANGE_AMPM_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*([ap]m)\s*(?:-|to)\s*(\d{1,2})(?::(\d{2}))?\b")
        .unwrap()
});
static RANGE_COMPACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{3,4})\s*(?:-|to)\s*(\d{3,4})\b").unwrap());

static RELATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(after|from|before)\s+(\d{1,2}(?::\d{2})?\s*[ap]m|\d{3,4}\s*[ap]m|\d{1,2}:\d{2}|\d{3,4})\b")
        .unwrap()
});
static FUZZY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(morning|afternoon|evening|night)\b").unwrap());
static NOTE_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(tbc|to be confirmed|flexible|tutor to propose|to be discussed)\b").unwrap()
});
static NEGATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(no|not|exclude|except)\b").unwrap());
static SINGLE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}(?::\d{2})?\s*[ap]m|\d{3,4}\s*[ap]m|\d{1,2}:\d{2}|\d{3,4})\b")
        .unwrap()
});

fn overlaps(covered: &[(usize, usize)], span: (usize, usize)) -> bool {
    covered.iter().any(|(a, b)| !(span.1 <= *a || span.0 >= *b))
}

/// Extract time-related events in one line; spans are byte offsets into it.
fn events_in_line(s: &str) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::new();
    let mut covered: Vec<(usize, usize)> = Vec::new();

    // Explicit ranges, most specific shapes first.
    let range_passes: [(usize, &Regex); 6] = [
        (0, &RANGE_AMPM_AMPM_RE),
        (1, &RANGE_AMPM_END_RE),
        (2, &RANGE_COMPACT_AMPM_RE),
        (3, &RANGE_24H_RE),
        (4, &RANGE_AMPM_START_RE),
        (5, &RANGE_COMPACT_RE),
    ];
    for (which, rx) in range_passes {
        for caps in rx.captures_iter(s) {
            let m = caps.get(0).unwrap();
            let span = (m.start(), m.end());
            if overlaps(&covered, span) {
                continue;
            }
            let win = match which {
                0 => {
                    let start = parse_time_token(&format!(
                        "{}:{}{}",
                        &caps[1],
                        caps.get(2).map_or("00", |m| m.as_str()),
                        &caps[3]
                    ));
                    let end = parse_time_token(&format!(
                        "{}:{}{}",
                        &caps[4],
                        caps.get(5).map_or("00", |m| m.as_str()),
                        &caps[6]
                    ));
                    start.zip(end).and_then(|(a, b)| window(a, b))
                }
                1 => {
                    let meridiem = &caps[5];
                    let start = parse_time_token(&format!(
                        "{}:{}{}",
                        &caps[1],
                        caps.get(2).map_or("00", |m| m.as_str()),
                        meridiem
                    ));
                    let end = parse_time_token(&format!(
                        "{}:{}{}",
                        &caps[3],
                        caps.get(4).map_or("00", |m| m.as_str()),
                        meridiem
                    ));
                    start.zip(end).and_then(|(a, b)| window(a, b))
                }
                2 => {
                    let start = parse_time_token(&format!("{}{}", &caps[1], &caps[2]));
                    let end = parse_time_token(&format!("{}{}", &caps[3], &caps[4]));
                    start.zip(end).and_then(|(a, b)| window(a, b))
                }
                3 => {
                    let start = parse_time_token(&format!("{}:{}", &caps[1], &caps[2]));
                    let end = parse_time_token(&format!("{}:{}", &caps[3], &caps[4]));
                    start.zip(end).and_then(|(a, b)| window(a, b))
                }
                4 => {
                    let meridiem = &caps[3];
                    let start = parse_time_token(&format!(
                        "{}:{}{}",
                        &caps[1],
                        caps.get(2).map_or("00", |m| m.as_str()),
                        meridiem
                    ));
                    let end = parse_time_token(&format!(
                        "{}:{}{}",
                        &caps[4],
                        caps.get(5).map_or("00", |m| m.as_str()),
                        meridiem
                    ));
                    start.zip(end).and_then(|(a, b)| window(a, b))
                }
                _ => {
                    let start = parse_time_token(&caps[1]);
                    let end = parse_time_token(&caps[2]);
                    start.zip(end).and_then(|(a, b)| window(a, b))
                }
            };
            if let Some(w) = win {
                out.push(Event {
                    kind: EventKind::ExplicitRange,
                    window: Some(w),
                    span,
                });
                covered.push(span);
            }
        }
    }

    // Relative phrases: "after 3pm" / "from 7pm" / "before 3pm".
    for caps in RELATIVE_RE.captures_iter(s) {
        let m = caps.get(0).unwrap();
        let span = (m.start(), m.end());
        if overlaps(&covered, span) {
            continue;
        }
        let Some(t) = parse_time_token(&caps[2]) else {
            continue;
        };
        let kw = caps[1].to_lowercase();
        let (kind, win) = match kw.as_str() {
            "after" | "from" => (EventKind::RelativeAfter, window(t, (23, 0))),
            _ => (EventKind::RelativeBefore, window((8, 0), t)),
        };
        if let Some(w) = win {
            out.push(Event {
                kind,
                window: Some(w),
                span,
            });
            covered.push(span);
        }
    }

    // Fuzzy words map to fixed estimated windows.
    for caps in FUZZY_RE.captures_iter(s) {
        let m = caps.get(0).unwrap();
        let span = (m.start(), m.end());
        if overlaps(&covered, span) {
            continue;
        }
        let w = match caps[1].to_lowercase().as_str() {
            "morning" => "08:00-12:00",
            "afternoon" => "12:00-17:00",
            "evening" => "16:00-21:00",
            _ => "19:00-23:00",
        };
        out.push(Event {
            kind: EventKind::Fuzzy,
            window: Some(w.to_string()),
            span,
        });
        covered.push(span);
    }

    // Note hints never create windows.
    for m in NOTE_HINT_RE.find_iter(s) {
        let span = (m.start(), m.end());
        if overlaps(&covered, span) {
            continue;
        }
        out.push(Event {
            kind: EventKind::Note,
            window: None,
            span,
        });
        covered.push(span);
    }

    // Single times: start == end, no inferred duration.
    for caps in SINGLE_TIME_RE.captures_iter(s) {
        let m = caps.get(0).unwrap();
        let span = (m.start(), m.end());
        if overlaps(&covered, span) {
            continue;
        }
        let Some(t) = parse_time_token(&caps[1]) else {
            continue;
        };
        out.push(Event {
            kind: EventKind::ExplicitSingle,
            window: window(t, t),
            span,
        });
        covered.push(span);
    }

    out
}

/// Split a line into clauses on ` / ` and ` | ` (whitespace-guarded so URLs
/// survive). Returns (byte offset, clause) pairs.
fn split_clauses(line: &str) -> Vec<(usize, &str)> {
    let mut parts: Vec<(usize, &str)> = Vec::new();
    let mut last = 0usize;
    for (i, c) in line.char_indices() {
        if c != '/' && c != '|' {
            continue;
        }
        let before_ws = line[..i]
            .chars()
            .next_back()
            .map(char::is_whitespace)
            .unwrap_or(false);
        let after_ws = line[i + c.len_utf8()..]
            .chars()
            .next()
            .map(char::is_whitespace)
            .unwrap_or(false);
        if before_ws && after_ws {
            let seg = &line[last..i];
            if !seg.trim().is_empty() {
                parts.push((last, seg));
            }
            last = i + c.len_utf8();
        }
    }
    let tail = &line[last..];
    if !tail.trim().is_empty() {
        parts.push((last, tail));
    }
    if parts.is_empty() {
        parts.push((0, line));
    }
    parts
}

fn looks_like_timing_header(s: &str) -> bool {
    static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(timing|available|availability|avail|preferably|preferred)\b").unwrap()
    });
    HEADER_RE.is_match(s)
}

/// For meta/debugging only: recover a raw-text substring for an evidence
/// span, falling back to the normalized form.
fn best_effort_original(raw: &str, normalized_substring: &str) -> String {
    if raw.is_empty() || normalized_substring.is_empty() {
        return normalized_substring.to_string();
    }
    let hay = raw.to_lowercase();
    let needle = normalized_substring.to_lowercase();
    if let Some(idx) = hay.find(&needle) {
        let end = idx + needle.len();
        if raw.is_char_boundary(idx) && end <= raw.len() && raw.is_char_boundary(end) {
            return raw[idx..end].to_string();
        }
    }
    normalized_substring.to_string()
}

fn day_names(days: &[Day]) -> Vec<String> {
    days.iter().map(|d| d.as_str().to_string()).collect()
}

/// Extract the time-availability structure from a post.
///
/// Conservative: a window is only ever attached to explicitly mentioned days,
/// either in the same clause, via the whole-line single-window rule, or via
/// the header-primed carry-over from the previous line.
pub fn extract_time_availability(raw_text: &str, normalized_text: &str) -> (TimeAvailability, TimeMeta) {
    let mut out = TimeAvailability::default();
    let mut meta = TimeMeta::default();

    if normalized_text.trim().is_empty() {
        return (out, meta);
    }

    let mut note_candidates: Vec<(usize, usize)> = Vec::new();
    let mut pending_days: Vec<Day> = Vec::new();
    let mut pending_context_hint = false;

    let mut offset = 0usize;
    for line in normalized_text.split('\n') {
        let line_start = offset;
        offset += line.len() + 1;

        if line.trim().is_empty() {
            continue;
        }

        let header_hint = looks_like_timing_header(line);
        let line_day_info = extract_days(line);
        let line_events = events_in_line(line);
        let line_windows: Vec<&Event> = line_events.iter().filter(|e| e.window.is_some()).collect();

        // Carry-over: a prior days-only line under a timing-ish header
        // donates its days to this line's windows.
        if !pending_days.is_empty()
            && pending_context_hint
            && line_day_info.days.is_empty()
            && !line_windows.is_empty()
        {
            for ev in &line_windows {
                let Some(win) = ev.window.as_ref() else { continue };
                let estimated = ev.is_estimated_kind();
                let target = if estimated { &mut out.estimated } else { &mut out.explicit };
                for d in &pending_days {
                    target.push_unique(*d, win);
                }
                let (s0, s1) = (line_start + ev.span.0, line_start + ev.span.1);
                meta.matched_spans.push(MatchedSpan {
                    span_type: if estimated { "estimated" } else { "explicit" }.to_string(),
                    days: day_names(&pending_days),
                    original_substring: best_effort_original(raw_text, &normalized_text[s0..s1]),
                    normalized_substring: normalized_text[s0..s1].to_string(),
                    start_idx: s0,
                    end_idx: s1,
                    window: Some(win.clone()),
                });
            }
            meta.rules_fired.push("carry_days_to_next_line".to_string());
            pending_days.clear();
            pending_context_hint = false;
        }

        for (clause_off, clause) in split_clauses(line) {
            let clause_start = line_start + clause_off;
            let day_info = extract_days(clause);
            let events = events_in_line(clause);
            let windows_in_clause = events.iter().filter(|e| e.window.is_some()).count();

            // Capture note hints even when no days are present.
            for ev in events.iter().filter(|e| e.kind == EventKind::Note) {
                let (s0, s1) = (clause_start + ev.span.0, clause_start + ev.span.1);
                note_candidates.push((s0, s1));
                meta.matched_spans.push(MatchedSpan {
                    span_type: "note".to_string(),
                    days: day_names(&day_info.days),
                    original_substring: best_effort_original(raw_text, &normalized_text[s0..s1]),
                    normalized_substring: normalized_text[s0..s1].to_string(),
                    start_idx: s0,
                    end_idx: s1,
                    window: None,
                });
                meta.rules_fired.push("note_hint".to_string());
            }

            // Without a day mention nothing is ever assigned to a day.
            if day_info.days.is_empty() {
                continue;
            }

            if NEGATION_RE.is_match(clause) && events.iter().any(|e| e.window.is_some()) {
                meta.parse_warnings.push("negation_detected_near_time".to_string());
            }

            // "weekdays"/"weekends"/"daily" with no concrete time in the
            // clause gets the full estimated day window.
            if day_info.broad && windows_in_clause == 0 {
                let full = "08:00-23:00";
                for d in &day_info.days {
                    out.estimated.push_unique(*d, full);
                }
                let kw = WEEKDAYS_RE.find(clause).or_else(|| WEEKENDS_RE.find(clause));
                if let Some(m) = kw {
                    let (s0, s1) = (clause_start + m.start(), clause_start + m.end());
                    meta.matched_spans.push(MatchedSpan {
                        span_type: "estimated".to_string(),
                        days: day_names(&day_info.days),
                        original_substring: best_effort_original(raw_text, &normalized_text[s0..s1]),
                        normalized_substring: normalized_text[s0..s1].to_string(),
                        start_idx: s0,
                        end_idx: s1,
                        window: Some(full.to_string()),
                    });
                }
                meta.rules_fired.push("fixed_weekday_weekend_range".to_string());
            }

            for ev in events.iter().filter(|e| e.window.is_some()) {
                let win = ev.window.as_ref().unwrap();
                let estimated = ev.is_estimated_kind() || day_info.broad || day_info.ranged;
                let rule = match ev.kind {
                    EventKind::ExplicitRange => "explicit_range",
                    EventKind::ExplicitSingle => "explicit_single_start_equals_end",
                    EventKind::RelativeAfter | EventKind::RelativeBefore => "relative_time_rule",
                    EventKind::Fuzzy => "fixed_fuzzy_range",
                    EventKind::Note => continue,
                };
                meta.rules_fired.push(rule.to_string());

                let target = if estimated { &mut out.estimated } else { &mut out.explicit };
                for d in &day_info.days {
                    target.push_unique(*d, win);
                }

                let (s0, s1) = (clause_start + ev.span.0, clause_start + ev.span.1);
                meta.matched_spans.push(MatchedSpan {
                    span_type: if estimated { "estimated" } else { "explicit" }.to_string(),
                    days: day_names(&day_info.days),
                    original_substring: best_effort_original(raw_text, &normalized_text[s0..s1]),
                    normalized_substring: normalized_text[s0..s1].to_string(),
                    start_idx: s0,
                    end_idx: s1,
                    window: Some(win.clone()),
                });
            }
        }

        // One day-list and exactly one window in the whole line: the window
        // applies to every listed day ("MON / THU / FRI - AFTER 4PM").
        if !line_day_info.days.is_empty() && line_windows.len() == 1 {
            let ev = line_windows[0];
            let win = ev.window.as_ref().unwrap();
            let estimated = ev.is_estimated_kind() || line_day_info.broad || line_day_info.ranged;
            let target = if estimated { &mut out.estimated } else { &mut out.explicit };
            let needs = line_day_info
                .days
                .iter()
                .any(|d| !target.get(*d).iter().any(|s| s == win));
            if needs {
                for d in &line_day_info.days {
                    target.push_unique(*d, win);
                }
                let (s0, s1) = (line_start + ev.span.0, line_start + ev.span.1);
                meta.matched_spans.push(MatchedSpan {
                    span_type: if estimated { "estimated" } else { "explicit" }.to_string(),
                    days: day_names(&line_day_info.days),
                    original_substring: best_effort_original(raw_text, &normalized_text[s0..s1]),
                    normalized_substring: normalized_text[s0..s1].to_string(),
                    start_idx: s0,
                    end_idx: s1,
                    window: Some(win.clone()),
                });
                meta.rules_fired
                    .push("single_time_applies_to_all_days_in_line".to_string());
            }
        }

        // Prime the next line's carry-over context.
        if !line_day_info.days.is_empty() && line_windows.is_empty() {
            pending_days = line_day_info.days.clone();
            pending_context_hint = pending_context_hint || header_hint;
        } else if !line_windows.is_empty() {
            pending_days.clear();
            pending_context_hint = false;
        } else if header_hint && line_day_info.days.is_empty() {
            pending_context_hint = true;
        }
    }

    if WEEKDAYS_RE.is_match(normalized_text) {
        meta.rules_fired.push("weekdays_keyword_seen".to_string());
    }
    if WEEKENDS_RE.is_match(normalized_text) {
        meta.rules_fired.push("weekends_keyword_seen".to_string());
    }

    // Earliest note hint wins; the note is a verbatim normalized substring.
    if let Some((s0, s1)) = note_candidates.into_iter().min() {
        let note = normalized_text[s0..s1].trim();
        out.note = (!note.is_empty()).then(|| note.to_string());
    }

    meta.rules_fired.sort();
    meta.rules_fired.dedup();
    meta.parse_warnings.sort();
    meta.parse_warnings.dedup();

    (out, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorpipe_core::types::Day;

    fn extract(text: &str) -> (TimeAvailability, TimeMeta) {
        let normalized = crate::normalize::normalize_text(text);
        extract_time_availability(text, &normalized)
    }

    #[test]
    fn parses_time_tokens() {
        assert_eq!(parse_time_token("7pm"), Some((19, 0)));
        assert_eq!(parse_time_token("7:30pm"), Some((19, 30)));
        assert_eq!(parse_time_token("11:45am"), Some((11, 45)));
        assert_eq!(parse_time_token("12am"), Some((0, 0)));
        assert_eq!(parse_time_token("12pm"), Some((12, 0)));
        assert_eq!(parse_time_token("19:30"), Some((19, 30)));
        assert_eq!(parse_time_token("730pm"), Some((19, 30)));
        assert_eq!(parse_time_token("1930"), Some((19, 30)));
        assert_eq!(parse_time_token("2560"), None);
        assert_eq!(parse_time_token("13pm"), None);
        assert_eq!(parse_time_token(""), None);
    }

    #[test]
    fn explicit_single_time_scenario() {
        let (ta, _) = extract("Timing: TUESDAY AT 7PM");
        assert_eq!(ta.explicit.tuesday, vec!["19:00-19:00"]);
        for d in Day::ALL {
            if d != Day::Tuesday {
                assert!(ta.explicit.get(d).is_empty(), "{d} should be empty");
            }
            assert!(ta.estimated.get(d).is_empty());
        }
        assert!(ta.note.is_none());
    }

    #[test]
    fn weekdays_concrete_time_flexible_and_negation_scenario() {
        let (ta, meta) = extract("Weekdays at 730pm / Saturday flexible / No Sunday before 3pm");
        for d in Day::WEEKDAYS {
            assert_eq!(ta.estimated.get(d), &vec!["19:30-19:30".to_string()], "{d}");
            assert!(ta.explicit.get(d).is_empty());
        }
        assert!(ta.explicit.saturday.is_empty());
        assert!(ta.estimated.saturday.is_empty());
        assert_eq!(ta.estimated.sunday, vec!["08:00-15:00"]);
        assert_eq!(ta.note.as_deref(), Some("flexible"));
        assert!(meta
            .parse_warnings
            .contains(&"negation_detected_near_time".to_string()));
    }

    #[test]
    fn explicit_range_stays_explicit() {
        let (ta, meta) = extract("Monday 2pm-4pm");
        assert_eq!(ta.explicit.monday, vec!["14:00-16:00"]);
        assert!(ta.estimated.monday.is_empty());
        assert!(meta.rules_fired.contains(&"explicit_range".to_string()));
    }

    #[test]
    fn range_with_trailing_meridiem_inherits_it() {
        let (ta, _) = extract("Wed 2-4pm");
        assert_eq!(ta.explicit.wednesday, vec!["14:00-16:00"]);
        let (ta, _) = extract("Thu 2:30-5:30pm");
        assert_eq!(ta.explicit.thursday, vec!["14:30-17:30"]);
    }

    #[test]
    fn day_range_is_estimated_even_with_concrete_time() {
        let (ta, _) = extract("Mon-Fri 7pm-9pm");
        for d in Day::WEEKDAYS {
            assert_eq!(ta.estimated.get(d), &vec!["19:00-21:00".to_string()], "{d}");
            assert!(ta.explicit.get(d).is_empty());
        }
    }

    #[test]
    fn weekdays_without_time_get_full_window() {
        let (ta, meta) = extract("Available on weekdays");
        for d in Day::WEEKDAYS {
            assert_eq!(ta.estimated.get(d), &vec!["08:00-23:00".to_string()], "{d}");
        }
        assert!(meta
            .rules_fired
            .contains(&"fixed_weekday_weekend_range".to_string()));
    }

    #[test]
    fn fuzzy_words_map_to_fixed_windows() {
        let (ta, _) = extract("Saturday morning");
        assert_eq!(ta.estimated.saturday, vec!["08:00-12:00"]);
        let (ta, _) = extract("Sunday night");
        assert_eq!(ta.estimated.sunday, vec!["19:00-23:00"]);
    }

    #[test]
    fn carry_over_applies_time_to_prior_day_list() {
        let (ta, meta) = extract("Availability:\nMon & Wed\n7pm-9pm");
        assert_eq!(ta.explicit.monday, vec!["19:00-21:00"]);
        assert_eq!(ta.explicit.wednesday, vec!["19:00-21:00"]);
        assert!(meta
            .rules_fired
            .contains(&"carry_days_to_next_line".to_string()));
    }

    #[test]
    fn one_window_applies_to_all_days_in_line() {
        let (ta, meta) = extract("MONDAY / THURSDAY / FRIDAY - AFTER 4PM");
        for d in [Day::Monday, Day::Thursday, Day::Friday] {
            assert_eq!(ta.estimated.get(d), &vec!["16:00-23:00".to_string()], "{d}");
        }
        assert!(meta
            .rules_fired
            .contains(&"single_time_applies_to_all_days_in_line".to_string()));
    }

    #[test]
    fn no_day_mention_no_windows() {
        let (ta, _) = extract("Lessons at 7pm");
        assert!(ta.explicit.is_empty());
        assert!(ta.estimated.is_empty());
    }

    #[test]
    fn slots_always_well_formed_and_deduped() {
        let (ta, _) = extract("Mon 7pm / Mon 7pm / Mon 7pm");
        assert_eq!(ta.explicit.monday, vec!["19:00-19:00"]);
        let slot_re = regex::Regex::new(r"^\d{2}:\d{2}-\d{2}:\d{2}$").unwrap();
        for (_, slots) in ta.explicit.iter().chain(ta.estimated.iter()) {
            for s in slots {
                assert!(slot_re.is_match(s), "malformed slot {s}");
                let (a, b) = s.split_once('-').unwrap();
                assert!(a <= b, "inverted slot {s}");
            }
        }
    }

    #[test]
    fn tbc_is_note_only() {
        let (ta, _) = extract("Monday timing tbc");
        assert!(ta.explicit.monday.is_empty());
        assert!(ta.estimated.monday.is_empty());
        assert_eq!(ta.note.as_deref(), Some("tbc"));
    }

    #[test]
    fn empty_input_yields_empty_structure() {
        let (ta, meta) = extract_time_availability("", "");
        assert!(ta.is_empty());
        assert!(meta.matched_spans.is_empty());
    }
}
