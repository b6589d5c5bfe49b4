//! Task engine for vaults of plain-text notes.
//! Lines are located by an external matcher, parsed into `Task` values, ranked,
//! bucketed for display, and edited in place one line at a time.

pub mod core {
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf, str::FromStr};

    /// Date format used for every stamp written into notes.
    pub const DATE_FORMAT: &str = "%Y-%m-%d";

    /// Normalize a calendar day to its last second, local wall-clock time.
    pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
        date.and_hms_opt(23, 59, 59)
            .expect("23:59:59 is a valid time of day")
    }

    /* ------------------------------- Status ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Status {
        Todo,
        InProgress,
        Cancelled,
        Done,
    }

    impl Status {
        /// Character written between the checkbox brackets for this status.
        pub fn checkbox_char(self) -> char {
            match self {
                Status::Todo => ' ',
                Status::InProgress => '/',
                Status::Cancelled => '-',
                Status::Done => 'x',
            }
        }

        pub fn is_open(self) -> bool {
            matches!(self, Status::Todo | Status::InProgress)
        }
    }

    impl FromStr for Status {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "todo" | "open" => Ok(Status::Todo),
                "in-progress" | "in_progress" | "doing" => Ok(Status::InProgress),
                "cancelled" | "canceled" => Ok(Status::Cancelled),
                "done" => Ok(Status::Done),
                _ => Err(DomainError::UnknownStatus(s.to_string())),
            }
        }
    }

    /* ------------------------------ Priority ------------------------------ */

    /// Priority 1 (highest) through 5 (lowest).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Priority(u8);

    impl Priority {
        pub const HIGHEST: Priority = Priority(1);
        pub const LOWEST: Priority = Priority(5);

        pub fn new(value: u8) -> Result<Self, DomainError> {
            if (Self::HIGHEST.0..=Self::LOWEST.0).contains(&value) {
                Ok(Self(value))
            } else {
                Err(DomainError::InvalidPriority(value))
            }
        }

        pub fn value(self) -> u8 {
            self.0
        }
    }

    impl Default for Priority {
        fn default() -> Self {
            Self::LOWEST
        }
    }

    /* ------------------------------- Urgency ------------------------------ */

    /// Classification of a due date relative to "now".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Urgency {
        Overdue,
        Today,
        Tomorrow,
        ThisWeek,
        Later,
        /// No due date; ranks below `Later`.
        None,
    }

    impl Urgency {
        pub fn classify(due: Option<NaiveDateTime>, now: NaiveDateTime) -> Self {
            let Some(due) = due else {
                return Urgency::None;
            };
            let today = now.date();
            if due < now {
                Urgency::Overdue
            } else if due.date() == today {
                Urgency::Today
            } else if today.succ_opt() == Some(due.date()) {
                Urgency::Tomorrow
            } else if due <= end_of_day(today) + Duration::days(7) {
                Urgency::ThisWeek
            } else {
                Urgency::Later
            }
        }

        /// Dominant scoring tier; higher is more urgent.
        pub fn tier(self) -> u8 {
            match self {
                Urgency::Overdue => 5,
                Urgency::Today => 4,
                Urgency::Tomorrow => 3,
                Urgency::ThisWeek => 2,
                Urgency::Later => 1,
                Urgency::None => 0,
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                Urgency::Overdue => "overdue",
                Urgency::Today => "today",
                Urgency::Tomorrow => "tomorrow",
                Urgency::ThisWeek => "this-week",
                Urgency::Later => "later",
                Urgency::None => "-",
            }
        }
    }

    impl fmt::Display for Urgency {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    /* -------------------------------- Task -------------------------------- */

    /// One actionable line of a note, derived fresh on every scan.
    ///
    /// `path` + `line` bind the task to a physical row only for as long as the
    /// file is not edited; mutations target that row, not this value.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        /// Absolute location of the owning note.
        pub path: PathBuf,
        /// Location relative to the vault root, as reported by the matcher.
        pub relative_path: String,
        /// File stem of the owning note.
        pub display_name: String,
        /// 1-based line number at scan time.
        pub line: usize,
        /// Line without bullet and checkbox; metadata markup is kept.
        pub text: String,
        pub status: Status,
        pub due: Option<NaiveDateTime>,
        pub snooze_until: Option<NaiveDateTime>,
        pub completed_at: Option<NaiveDateTime>,
        pub priority: Priority,
        pub urgency: Urgency,
        /// Modification time of the owning note when it was scanned.
        pub mtime: NaiveDateTime,
    }

    impl Task {
        /// Text with recognized metadata tokens removed, for display.
        pub fn title(&self) -> String {
            crate::parser::display_title(&self.text)
        }

        pub fn is_snoozed(&self, now: NaiveDateTime) -> bool {
            self.snooze_until.is_some_and(|until| until > now)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown task status {0:?}")]
        UnknownStatus(String),
        #[error("priority {0} is out of bounds (1..=5)")]
        InvalidPriority(u8),
        #[error("invalid date target {0:?}; expected YYYY-MM-DD, +Nd, +Nw, today or tomorrow")]
        InvalidDateTarget(String),
    }

}

pub mod notation {
    //! Date-bearing markup recognised inside a task line.
    //!
    //! Each notation is a small `nom` parser tried at every char boundary of the
    //! line. The same spans drive extraction in `parser` and in-place rewriting
    //! in `mutate`, so a date is always replaced in the style it was written.

    use chrono::NaiveDate;
    use nom::{
        IResult, Offset,
        bytes::complete::{tag, tag_no_case, take_while},
        character::complete::{char, space0},
        combinator::{opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Notation {
        /// `📅 2024-03-01`, optionally as `[📅 2024-03-01]`.
        Emoji,
        /// `due:: [[2024-03-01]]`
        FieldLink,
        /// `due: 2024-03-01`
        Key,
        /// `due(2024-03-01)`
        Call,
    }

    impl Notation {
        /// Order in which notations are tried; the first hit wins.
        pub const SEARCH_ORDER: [Notation; 4] = [
            Notation::Emoji,
            Notation::FieldLink,
            Notation::Key,
            Notation::Call,
        ];

        fn is_keyed(self) -> bool {
            !matches!(self, Notation::Emoji)
        }
    }

    /// Marker emoji plus the inline-field keys naming one date field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Vocabulary {
        pub emoji: &'static str,
        pub keys: &'static [&'static str],
    }

    pub const DUE: Vocabulary = Vocabulary {
        emoji: "📅",
        keys: &["due"],
    };

    pub const DONE: Vocabulary = Vocabulary {
        emoji: "✅",
        keys: &["done", "completed"],
    };

    pub const CANCELLED: Vocabulary = Vocabulary {
        emoji: "❌",
        keys: &["cancelled"],
    };

    /// Snooze has a single dedicated notation.
    pub const SNOOZE: Vocabulary = Vocabulary {
        emoji: "💤",
        keys: &[],
    };

    /// Byte offsets of one notation occurrence inside a line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DateSpan {
        pub notation: Notation,
        /// Whole notation, brackets included.
        pub start: usize,
        pub end: usize,
        /// The `YYYY-MM-DD` token alone.
        pub date_start: usize,
        pub date_end: usize,
    }

    impl DateSpan {
        pub fn date_text<'a>(&self, line: &'a str) -> &'a str {
            &line[self.date_start..self.date_end]
        }

        /// Calendar date, or `None` when the token is date-shaped but invalid.
        pub fn date(&self, line: &str) -> Option<NaiveDate> {
            NaiveDate::parse_from_str(self.date_text(line), super::core::DATE_FORMAT).ok()
        }
    }

    /// All occurrences of one notation, left to right, without overlap.
    pub fn find_all(line: &str, vocab: &Vocabulary, notation: Notation) -> Vec<DateSpan> {
        let mut out = Vec::new();
        let mut resume = 0;
        for (idx, _) in line.char_indices() {
            if idx < resume {
                continue;
            }
            if notation.is_keyed() && !at_word_start(line, idx) {
                continue;
            }
            let input = &line[idx..];
            if let Some((rest, date)) = parse_at(notation, vocab, input) {
                let date_start = idx + input.offset(date);
                let end = line.len() - rest.len();
                out.push(DateSpan {
                    notation,
                    start: idx,
                    end,
                    date_start,
                    date_end: date_start + date.len(),
                });
                resume = end;
            }
        }
        out
    }

    /// First occurrence whose date is a real calendar day, notations in search order.
    pub fn find_date(line: &str, vocab: &Vocabulary) -> Option<(DateSpan, NaiveDate)> {
        Notation::SEARCH_ORDER.iter().find_map(|notation| {
            find_all(line, vocab, *notation)
                .into_iter()
                .find_map(|span| span.date(line).map(|date| (span, date)))
        })
    }

    /// First occurrence in search order, valid date or not. Used for rewriting.
    pub fn locate(line: &str, vocab: &Vocabulary) -> Option<DateSpan> {
        Notation::SEARCH_ORDER
            .iter()
            .find_map(|notation| find_all(line, vocab, *notation).into_iter().next())
    }

    /// Every occurrence across all notations.
    pub fn spans(line: &str, vocab: &Vocabulary) -> Vec<DateSpan> {
        Notation::SEARCH_ORDER
            .iter()
            .flat_map(|notation| find_all(line, vocab, *notation))
            .collect()
    }

    fn at_word_start(line: &str, idx: usize) -> bool {
        line[..idx]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'))
    }

    fn parse_at<'a>(
        notation: Notation,
        vocab: &Vocabulary,
        i: &'a str,
    ) -> Option<(&'a str, &'a str)> {
        match notation {
            Notation::Emoji => emoji_form(vocab.emoji, i).ok(),
            Notation::FieldLink => vocab.keys.iter().find_map(|k| field_link_form(k, i).ok()),
            Notation::Key => vocab.keys.iter().find_map(|k| key_form(k, i).ok()),
            Notation::Call => vocab.keys.iter().find_map(|k| call_form(k, i).ok()),
        }
    }

    /* ------------------------------ Parsers ------------------------------ */

    fn emoji_form<'a>(emoji: &str, i: &'a str) -> PResult<'a, &'a str> {
        let (i, open) = opt(char('['))(i)?;
        let (i, _) = tag(emoji)(i)?;
        let (i, _) = opt(char('\u{FE0F}'))(i)?;
        let (i, _) = space0(i)?;
        let (i, date) = date_token(i)?;
        let (i, _) = match open {
            Some(_) => opt(char(']'))(i)?,
            None => (i, None),
        };
        Ok((i, date))
    }

    fn field_link_form<'a>(key: &str, i: &'a str) -> PResult<'a, &'a str> {
        let (i, _) = tag_no_case(key)(i)?;
        let (i, _) = tag("::")(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = tag("[[")(i)?;
        let (i, date) = date_token(i)?;
        let (i, _) = tag("]]")(i)?;
        Ok((i, date))
    }

    /// Also takes the bare inline-field spelling `due:: 2024-03-01`.
    fn key_form<'a>(key: &str, i: &'a str) -> PResult<'a, &'a str> {
        let (i, _) = tag_no_case(key)(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = opt(char(':'))(i)?;
        let (i, _) = space0(i)?;
        date_token(i)
    }

    fn call_form<'a>(key: &str, i: &'a str) -> PResult<'a, &'a str> {
        let (i, _) = tag_no_case(key)(i)?;
        let (i, _) = char('(')(i)?;
        let (i, _) = space0(i)?;
        let (i, date) = date_token(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char(')')(i)?;
        Ok((i, date))
    }

    /// `YYYY-MM-DD` by shape only; calendar validity is checked by `DateSpan::date`.
    fn date_token(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while_m_n(4, 4, char_is_digit),
            char('-'),
            take_while_m_n(2, 2, char_is_digit),
            char('-'),
            take_while_m_n(2, 2, char_is_digit),
        )))(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod parser {
    //! Raw matched line -> `Task`.
    //!
    //! `parse_task` is total: anything it does not recognise falls back to the
    //! defaults (Todo, priority 5, no dates).

    use crate::core::*;
    use crate::notation::{self, CANCELLED, DONE, DUE, SNOOZE};
    use chrono::NaiveDateTime;
    use nom::{
        IResult, Offset,
        character::complete::{anychar, char, one_of, space0, space1},
        error::VerboseError,
    };
    use std::path::Path;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Checkbox characters consulted in order; anything else reads as Todo.
    const STATUS_MARKS: [(char, Status); 4] = [
        ('/', Status::InProgress),
        ('-', Status::Cancelled),
        ('x', Status::Done),
        ('X', Status::Done),
    ];

    /// Priority glyphs, highest first. When several appear the first entry found wins.
    pub const PRIORITY_MARKERS: [(&str, u8); 5] =
        [("🔺", 1), ("⏫", 2), ("🔼", 3), ("🔽", 4), ("⏬", 5)];

    /// Leading `- [c] ` of a task line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Checkbox {
        pub mark: char,
        /// Byte range of `mark` inside the line.
        pub mark_start: usize,
        pub mark_end: usize,
        /// Where the task text begins, past the spaces after `]`.
        pub body_start: usize,
    }

    pub fn checkbox(line: &str) -> Option<Checkbox> {
        let (after_box, mark) = checkbox_prefix(line).ok()?;
        let mark_end = line.offset(after_box) - ']'.len_utf8();
        let (body, _) = space0::<_, VerboseError<&str>>(after_box).ok()?;
        Some(Checkbox {
            mark,
            mark_start: mark_end - mark.len_utf8(),
            mark_end,
            body_start: line.offset(body),
        })
    }

    fn checkbox_prefix(i: &str) -> PResult<'_, char> {
        let (i, _) = space0(i)?;
        let (i, _) = one_of("-*+")(i)?;
        let (i, _) = space1(i)?;
        let (i, _) = char('[')(i)?;
        let (i, mark) = anychar(i)?;
        let (i, _) = char(']')(i)?;
        Ok((i, mark))
    }

    pub fn status_for_mark(mark: char) -> Status {
        STATUS_MARKS
            .iter()
            .find(|(c, _)| *c == mark)
            .map(|(_, status)| *status)
            .unwrap_or(Status::Todo)
    }

    pub fn detect_priority(text: &str) -> Priority {
        PRIORITY_MARKERS
            .iter()
            .find(|(glyph, _)| text.contains(glyph))
            .and_then(|(_, value)| Priority::new(*value).ok())
            .unwrap_or_default()
    }

    /// Build a `Task` from one matched line.
    ///
    /// `mtime` is the owning file's modification time; it doubles as the completion
    /// time of done tasks that carry no explicit stamp.
    pub fn parse_task(
        path: &Path,
        relative_path: &str,
        line: usize,
        raw: &str,
        mtime: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Task {
        let (status, text) = match checkbox(raw) {
            Some(cb) => (status_for_mark(cb.mark), raw[cb.body_start..].trim()),
            None => (Status::Todo, raw.trim()),
        };

        let due = notation::find_date(text, &DUE).map(|(_, d)| end_of_day(d));
        let snooze_until = notation::find_date(text, &SNOOZE).map(|(_, d)| end_of_day(d));
        let completed_at = match status {
            Status::Done => Some(
                notation::find_date(text, &DONE)
                    .map(|(_, d)| end_of_day(d))
                    .unwrap_or(mtime),
            ),
            _ => None,
        };

        Task {
            path: path.to_path_buf(),
            relative_path: relative_path.to_string(),
            display_name: display_name(relative_path),
            line,
            text: text.to_string(),
            status,
            due,
            snooze_until,
            completed_at,
            priority: detect_priority(text),
            urgency: Urgency::classify(due, now),
            mtime,
        }
    }

    fn display_name(relative_path: &str) -> String {
        Path::new(relative_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative_path.to_string())
    }

    /// Strip priority glyphs and date notations, collapsing whitespace.
    pub fn display_title(text: &str) -> String {
        let mut cuts: Vec<(usize, usize)> = Vec::new();
        for vocab in [&DUE, &SNOOZE, &DONE, &CANCELLED] {
            cuts.extend(
                notation::spans(text, vocab)
                    .into_iter()
                    .map(|span| (span.start, span.end)),
            );
        }
        for (glyph, _) in PRIORITY_MARKERS {
            cuts.extend(text.match_indices(glyph).map(|(idx, g)| (idx, idx + g.len())));
        }
        cuts.sort_unstable();

        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        for (start, end) in cuts {
            if start < pos {
                pos = pos.max(end);
                continue;
            }
            out.push_str(&text[pos..start]);
            pos = end;
        }
        out.push_str(&text[pos..]);
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }

}

pub mod score {
    //! Composite ranking.
    //!
    //! Tiers, most significant first: urgency, priority, due proximity plus
    //! recency, line number. Each tier's full range is smaller than one step of
    //! the tier above it.

    use crate::config::EngineConfig;
    use crate::core::*;
    use chrono::{Duration, NaiveDateTime};

    pub const URGENCY_STEP: f64 = 1_000_000.0;
    pub const PRIORITY_STEP: f64 = 10_000.0;
    const PROXIMITY_MAX: f64 = 4_000.0;
    const OVERDUE_BONUS_MAX: f64 = 1_000.0;
    const OVERDUE_BONUS_DAYS: f64 = 30.0;
    const RECENCY_MAX: f64 = 3_000.0;
    const SECONDS_PER_DAY: f64 = 86_400.0;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Scorer {
        recency_window: Duration,
    }

    impl Default for Scorer {
        fn default() -> Self {
            Self::new(Duration::days(7))
        }
    }

    impl Scorer {
        pub fn new(recency_window: Duration) -> Self {
            Self { recency_window }
        }

        pub fn from_config(config: &EngineConfig) -> Self {
            Self::new(config.recency_window_delta())
        }

        /// Higher is shown first.
        pub fn score(&self, task: &Task, now: NaiveDateTime) -> f64 {
            let urgency = f64::from(task.urgency.tier()) * URGENCY_STEP;
            let priority =
                f64::from(Priority::LOWEST.value() - task.priority.value()) * PRIORITY_STEP;
            let tie_break = proximity(task.due, now) + self.recency(task.mtime, now);
            let line = 1.0 / (task.line as f64 + 1.0);
            urgency + priority + tie_break + line
        }

        /// Sort descending by score. Equal scores keep their input order.
        pub fn rank(&self, tasks: Vec<Task>, now: NaiveDateTime) -> Vec<Task> {
            let mut scored: Vec<(f64, Task)> = tasks
                .into_iter()
                .map(|task| (self.score(&task, now), task))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            scored.into_iter().map(|(_, task)| task).collect()
        }

        fn recency(&self, mtime: NaiveDateTime, now: NaiveDateTime) -> f64 {
            let window = self.recency_window.num_seconds() as f64;
            if window <= 0.0 {
                return 0.0;
            }
            let age = (now - mtime).num_seconds().max(0) as f64;
            RECENCY_MAX * (1.0 - age / window).clamp(0.0, 1.0)
        }
    }

    fn proximity(due: Option<NaiveDateTime>, now: NaiveDateTime) -> f64 {
        let Some(due) = due else {
            return 0.0;
        };
        let days = (due - now).num_seconds() as f64 / SECONDS_PER_DAY;
        if days < 0.0 {
            let overdue = (-days).min(OVERDUE_BONUS_DAYS);
            PROXIMITY_MAX + OVERDUE_BONUS_MAX * overdue / OVERDUE_BONUS_DAYS
        } else {
            PROXIMITY_MAX / (1.0 + days)
        }
    }

}

pub mod bucket {
    //! Display groups for the dashboard.

    use crate::core::*;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum GroupKind {
        Overdue,
        Today,
        ThisWeek,
        Other,
        Done,
    }

    impl GroupKind {
        /// Presentation order.
        pub const ORDER: [GroupKind; 5] = [
            GroupKind::Overdue,
            GroupKind::Today,
            GroupKind::ThisWeek,
            GroupKind::Other,
            GroupKind::Done,
        ];

        pub fn label(self) -> &'static str {
            match self {
                GroupKind::Overdue => "Overdue",
                GroupKind::Today => "Today",
                GroupKind::ThisWeek => "This week",
                GroupKind::Other => "Other",
                GroupKind::Done => "Done",
            }
        }

        fn for_task(task: &Task) -> Option<Self> {
            match task.status {
                Status::Done => Some(GroupKind::Done),
                Status::Cancelled => None,
                Status::Todo | Status::InProgress => Some(match task.urgency {
                    Urgency::Overdue => GroupKind::Overdue,
                    Urgency::Today => GroupKind::Today,
                    Urgency::Tomorrow | Urgency::ThisWeek => GroupKind::ThisWeek,
                    Urgency::Later | Urgency::None => GroupKind::Other,
                }),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskGroup {
        pub kind: GroupKind,
        pub tasks: Vec<Task>,
        /// Tasks that belonged here but were cut by the cap.
        pub overflow: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Dashboard {
        pub groups: Vec<TaskGroup>,
        /// Open tasks past due, uncapped.
        pub overdue: usize,
        /// Open tasks due today, uncapped.
        pub due_today: usize,
    }

    impl Dashboard {
        pub fn group(&self, kind: GroupKind) -> Option<&TaskGroup> {
            self.groups.iter().find(|g| g.kind == kind)
        }
    }

    /// Partition ranked tasks into capped groups. Input order is kept inside each
    /// group except Done, which is most-recently-completed first.
    pub fn bucketize(tasks: &[Task], cap: usize) -> Dashboard {
        let mut buckets: IndexMap<GroupKind, Vec<&Task>> =
            GroupKind::ORDER.iter().map(|k| (*k, Vec::new())).collect();

        let mut overdue = 0;
        let mut due_today = 0;
        for task in tasks {
            if task.status.is_open() {
                match task.urgency {
                    Urgency::Overdue => overdue += 1,
                    Urgency::Today => due_today += 1,
                    _ => {}
                }
            }
            if let Some(kind) = GroupKind::for_task(task) {
                buckets.entry(kind).or_default().push(task);
            }
        }

        if let Some(done) = buckets.get_mut(&GroupKind::Done) {
            done.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        }

        let groups = buckets
            .into_iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(kind, members)| {
                let overflow = members.len().saturating_sub(cap);
                TaskGroup {
                    kind,
                    tasks: members.into_iter().take(cap).cloned().collect(),
                    overflow,
                }
            })
            .collect();

        Dashboard {
            groups,
            overdue,
            due_today,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::{NaiveDate, NaiveDateTime};
        use std::path::PathBuf;

        fn at(d: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, d)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap()
        }

        fn task(line: usize, status: Status, urgency: Urgency, completed: Option<u32>) -> Task {
            Task {
                path: PathBuf::from("/v/a.md"),
                relative_path: "a.md".into(),
                display_name: "a".into(),
                line,
                text: format!("task {line}"),
                status,
                due: None,
                snooze_until: None,
                completed_at: completed.map(at),
                priority: Priority::default(),
                urgency,
                mtime: at(1),
            }
        }

        fn lines(group: &TaskGroup) -> Vec<usize> {
            group.tasks.iter().map(|t| t.line).collect()
        }

        #[test]
        fn groups_follow_presentation_order_and_skip_empty() {
            let tasks = vec![
                task(1, Status::Todo, Urgency::None, None),
                task(2, Status::Done, Urgency::None, Some(3)),
                task(3, Status::InProgress, Urgency::Overdue, None),
                task(4, Status::Todo, Urgency::Tomorrow, None),
                task(5, Status::Todo, Urgency::ThisWeek, None),
            ];
            let dash = bucketize(&tasks, 10);
            let kinds: Vec<_> = dash.groups.iter().map(|g| g.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    GroupKind::Overdue,
                    GroupKind::ThisWeek,
                    GroupKind::Other,
                    GroupKind::Done
                ]
            );
            assert_eq!(lines(dash.group(GroupKind::ThisWeek).unwrap()), vec![4, 5]);
            assert!(dash.group(GroupKind::Today).is_none());
        }

        #[test]
        fn cap_reports_overflow() {
            let tasks: Vec<_> = (1..=5)
                .map(|i| task(i, Status::Todo, Urgency::Today, None))
                .collect();
            let dash = bucketize(&tasks, 2);
            let today = dash.group(GroupKind::Today).unwrap();
            assert_eq!(lines(today), vec![1, 2]);
            assert_eq!(today.overflow, 3);
            assert_eq!(dash.due_today, 5);
        }

        #[test]
        fn done_is_most_recent_first() {
            let tasks = vec![
                task(1, Status::Done, Urgency::None, Some(2)),
                task(2, Status::Done, Urgency::Overdue, Some(9)),
                task(3, Status::Done, Urgency::None, Some(5)),
            ];
            let dash = bucketize(&tasks, 10);
            assert_eq!(lines(dash.group(GroupKind::Done).unwrap()), vec![2, 3, 1]);
            assert_eq!(dash.overdue, 0);
        }

        #[test]
        fn cancelled_tasks_are_left_out() {
            let tasks = vec![task(1, Status::Cancelled, Urgency::Overdue, None)];
            let dash = bucketize(&tasks, 10);
            assert!(dash.groups.is_empty());
            assert_eq!(dash.overdue, 0);
        }
    }
}

pub mod config {
    //! Engine settings. Every field has a default so a config file may be partial.

    use chrono::Duration as TimeDelta;
    use serde::{Deserialize, Serialize};
    use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct EngineConfig {
        /// Line matcher executable, looked up on `PATH`.
        pub matcher_program: String,
        /// Notes considered by the matcher, e.g. `*.md`.
        pub note_globs: Vec<String>,
        /// Vault-relative globs never searched (archives, app config, templates, trash).
        pub exclude_globs: Vec<String>,
        /// Maximum tasks emitted per dashboard group.
        pub group_cap: usize,
        /// Edits older than this earn no recency bonus.
        #[serde_as(as = "DurationSeconds<u64>")]
        pub recency_window: Duration,
        /// Suggested wait after a mutation before rescanning.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub rescan_settle: Duration,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                matcher_program: "rg".into(),
                note_globs: vec!["*.md".into()],
                exclude_globs: vec![
                    "**/archive/**".into(),
                    "**/.obsidian/**".into(),
                    "**/templates/**".into(),
                    "**/.trash/**".into(),
                ],
                group_cap: 10,
                recency_window: Duration::from_secs(7 * 24 * 60 * 60),
                rescan_settle: Duration::from_millis(750),
            }
        }
    }

    impl EngineConfig {
        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            config.validate()?;
            Ok(config)
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            if self.matcher_program.trim().is_empty() {
                return Err(ConfigError::Invalid("matcher_program is empty".into()));
            }
            if self.group_cap == 0 {
                return Err(ConfigError::Invalid("group_cap must be at least 1".into()));
            }
            Ok(())
        }

        pub fn recency_window_delta(&self) -> TimeDelta {
            TimeDelta::from_std(self.recency_window).unwrap_or_else(|_| TimeDelta::days(7))
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("reading config {path:?}")]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("parsing config {path:?}")]
        Parse {
            path: PathBuf,
            source: serde_json::Error,
        },
        #[error("invalid config: {0}")]
        Invalid(String),
    }

}

pub mod matcher {
    //! External line matcher.
    //!
    //! The search itself is delegated to ripgrep; this module only builds the
    //! invocation and reads its `path:line:text` output.

    use crate::config::EngineConfig;
    use crate::core::Status;
    use std::{
        path::{Path, PathBuf},
        process::{Command, Stdio},
    };
    use tracing::{debug, warn};

    /// One candidate line reported by the matcher.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LineMatch {
        pub relative_path: String,
        /// 1-based.
        pub line: usize,
        pub text: String,
    }

    /// Checkbox forms searched for, one matcher run each.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MatchClass {
        Todo,
        InProgress,
        Done,
    }

    impl MatchClass {
        pub const ALL: [MatchClass; 3] = [MatchClass::Todo, MatchClass::InProgress, MatchClass::Done];

        pub fn pattern(self) -> &'static str {
            match self {
                MatchClass::Todo => r"^\s*[-*+]\s+\[ \]",
                MatchClass::InProgress => r"^\s*[-*+]\s+\[/\]",
                MatchClass::Done => r"^\s*[-*+]\s+\[[xX]\]",
            }
        }

        /// Whether a checkbox character belongs to this class.
        pub fn accepts_mark(self, mark: char) -> bool {
            match self {
                MatchClass::Todo => mark == ' ',
                MatchClass::InProgress => mark == '/',
                MatchClass::Done => mark.eq_ignore_ascii_case(&'x'),
            }
        }

        pub fn status(self) -> Status {
            match self {
                MatchClass::Todo => Status::Todo,
                MatchClass::InProgress => Status::InProgress,
                MatchClass::Done => Status::Done,
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum MatcherError {
        #[error("line matcher `{program}` is not installed")]
        ToolUnavailable { program: String },
        #[error("failed to run line matcher `{program}`")]
        Spawn {
            program: String,
            source: std::io::Error,
        },
        #[error("line matcher `{program}` exited with {code:?}: {stderr}")]
        Failed {
            program: String,
            code: Option<i32>,
            stderr: String,
        },
    }

    pub trait LineMatcher {
        /// Lines under `root` matching any of `classes`, skipping `excludes`.
        fn find(
            &self,
            root: &Path,
            classes: &[MatchClass],
            excludes: &[String],
        ) -> Result<Vec<LineMatch>, MatcherError>;
    }

    /// `rg`-backed matcher.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RipgrepMatcher {
        program: String,
        note_globs: Vec<String>,
    }

    impl RipgrepMatcher {
        pub fn new(program: impl Into<String>, note_globs: Vec<String>) -> Self {
            Self {
                program: program.into(),
                note_globs,
            }
        }

        pub fn from_config(config: &EngineConfig) -> Self {
            Self::new(config.matcher_program.clone(), config.note_globs.clone())
        }

        fn resolve_program(&self) -> Result<PathBuf, MatcherError> {
            which::which(&self.program).map_err(|_| MatcherError::ToolUnavailable {
                program: self.program.clone(),
            })
        }

        fn command(
            &self,
            program: &Path,
            root: &Path,
            classes: &[MatchClass],
            excludes: &[String],
        ) -> Command {
            let mut cmd = Command::new(program);
            cmd.current_dir(root)
                .stdin(Stdio::null())
                .args([
                    "--no-config",
                    "--no-heading",
                    "--with-filename",
                    "--line-number",
                    "--color",
                    "never",
                ]);
            for class in classes {
                cmd.arg("-e").arg(class.pattern());
            }
            for glob in &self.note_globs {
                cmd.arg("--iglob").arg(glob);
            }
            for glob in excludes {
                cmd.arg("--iglob").arg(format!("!{glob}"));
            }
            cmd.arg(".");
            cmd
        }
    }

    impl LineMatcher for RipgrepMatcher {
        fn find(
            &self,
            root: &Path,
            classes: &[MatchClass],
            excludes: &[String],
        ) -> Result<Vec<LineMatch>, MatcherError> {
            let program = self.resolve_program()?;
            let mut cmd = self.command(&program, root, classes, excludes);
            debug!(?cmd, "running line matcher");
            let output = cmd.output().map_err(|source| MatcherError::Spawn {
                program: self.program.clone(),
                source,
            })?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            match output.status.code() {
                // 1 means "no matches".
                Some(0) | Some(1) => Ok(parse_output(&stdout)),
                Some(2) if !stdout.is_empty() => {
                    warn!(
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "line matcher reported errors, keeping partial results"
                    );
                    Ok(parse_output(&stdout))
                }
                code => Err(MatcherError::Failed {
                    program: self.program.clone(),
                    code,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }),
            }
        }
    }

    pub fn parse_output(stdout: &str) -> Vec<LineMatch> {
        stdout.lines().filter_map(parse_match_line).collect()
    }

    /// Parse `relative/path.md:12:line text`; text may itself contain colons.
    pub fn parse_match_line(line: &str) -> Option<LineMatch> {
        let mut parts = line.splitn(3, ':');
        let path = parts.next()?;
        let number = parts.next()?.parse::<usize>().ok()?;
        let text = parts.next()?;
        let path = path.strip_prefix("./").unwrap_or(path);
        if path.is_empty() || number == 0 {
            return None;
        }
        Some(LineMatch {
            relative_path: path.to_string(),
            line: number,
            text: text.to_string(),
        })
    }

}

pub mod mutate {
    //! Line-targeted rewrites of task metadata.
    //!
    //! Only the target line changes; every other byte of the file is written back
    //! exactly as read. The new content goes to a temporary file in the same
    //! directory which then replaces the original with a rename.
    //!
    //! The file is not locked. An external editor writing between our read and our
    //! rename loses its change (or we lose ours); neither is detected.

    use crate::core::*;
    use crate::notation::{self, CANCELLED, DONE, DUE, SNOOZE, Vocabulary};
    use crate::parser::checkbox;
    use chrono::{Datelike, Days, Duration, NaiveDate, Weekday};
    use std::{
        fs,
        io::Write,
        path::{Path, PathBuf},
        str::FromStr,
        time::Duration as StdDuration,
    };
    use tempfile::NamedTempFile;
    use tracing::{debug, warn};

    /* ----------------------------- Date targets ----------------------------- */

    /// A date given either outright or as an offset from today.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateTarget {
        On(NaiveDate),
        InDays(u32),
    }

    impl DateTarget {
        pub fn resolve(self, today: NaiveDate) -> NaiveDate {
            match self {
                DateTarget::On(date) => date,
                DateTarget::InDays(n) => today
                    .checked_add_days(Days::new(u64::from(n)))
                    .unwrap_or(NaiveDate::MAX),
            }
        }
    }

    impl FromStr for DateTarget {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let trimmed = s.trim();
            let invalid = || DomainError::InvalidDateTarget(s.to_string());
            match trimmed.to_ascii_lowercase().as_str() {
                "today" => return Ok(DateTarget::InDays(0)),
                "tomorrow" => return Ok(DateTarget::InDays(1)),
                _ => {}
            }
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
                return Ok(DateTarget::On(date));
            }
            let offset = trimmed.strip_prefix('+').unwrap_or(trimmed);
            let (count, per) = if let Some(n) = offset.strip_suffix(['d', 'D']) {
                (n, 1)
            } else if let Some(n) = offset.strip_suffix(['w', 'W']) {
                (n, 7)
            } else {
                return Err(invalid());
            };
            let count: u32 = count.parse().map_err(|_| invalid())?;
            count
                .checked_mul(per)
                .map(DateTarget::InDays)
                .ok_or_else(invalid)
        }
    }

    /// Saturday and Sunday move forward to Monday.
    pub fn next_weekday(date: NaiveDate) -> NaiveDate {
        match date.weekday() {
            Weekday::Sat => date + Duration::days(2),
            Weekday::Sun => date + Duration::days(1),
            _ => date,
        }
    }

    /* ------------------------------ Transforms ------------------------------ */

    /// Named line edits. Applying one is pure: line in, line out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineTransform {
        SetStatus(Status),
        SetDue(DateTarget),
        /// Offsets landing on a weekend move to the following Monday.
        SetSnooze(DateTarget),
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TransformError {
        #[error("line has no checkbox to update")]
        NoCheckbox,
        #[error("replacement spans more than one line")]
        MultiLine,
    }

    impl LineTransform {
        pub fn apply(&self, line: &str, today: NaiveDate) -> Result<String, TransformError> {
            let out = match *self {
                LineTransform::SetStatus(status) => set_status(line, status, today)?,
                LineTransform::SetDue(target) => replace_or_append(line, &DUE, target.resolve(today)),
                LineTransform::SetSnooze(target) => {
                    let date = match target {
                        DateTarget::On(date) => date,
                        offset => next_weekday(offset.resolve(today)),
                    };
                    replace_or_append(line, &SNOOZE, date)
                }
            };
            if out.contains(['\n', '\r']) {
                return Err(TransformError::MultiLine);
            }
            Ok(out)
        }
    }

    fn set_status(line: &str, status: Status, today: NaiveDate) -> Result<String, TransformError> {
        let cb = checkbox(line).ok_or(TransformError::NoCheckbox)?;
        let mut out = String::with_capacity(line.len() + 16);
        out.push_str(&line[..cb.mark_start]);
        out.push(status.checkbox_char());
        out.push_str(&line[cb.mark_end..]);

        let stale: &[&Vocabulary] = match status {
            Status::Done => &[&CANCELLED],
            Status::Cancelled => &[&DONE],
            Status::Todo | Status::InProgress => &[&DONE, &CANCELLED],
        };
        let stamp = match status {
            Status::Done => Some(&DONE),
            Status::Cancelled => Some(&CANCELLED),
            Status::Todo | Status::InProgress => None,
        };
        for vocab in stale {
            out = remove_notations(&out, vocab);
        }
        if let Some(vocab) = stamp {
            if notation::locate(&out, vocab).is_none() {
                out = append_token(&out, vocab.emoji, today);
            }
        }
        Ok(out)
    }

    /// Drop every notation of `vocab` together with the space in front of it.
    fn remove_notations(line: &str, vocab: &Vocabulary) -> String {
        let mut spans = notation::spans(line, vocab);
        spans.sort_by_key(|span| span.start);
        let mut out = String::with_capacity(line.len());
        let mut pos = 0;
        for span in spans {
            if span.start < pos {
                continue;
            }
            let kept = &line[pos..span.start];
            out.push_str(kept.strip_suffix(' ').unwrap_or(kept));
            pos = span.end;
        }
        out.push_str(&line[pos..]);
        out
    }

    /// Rewrite the date of the first notation present, else append the emoji form.
    fn replace_or_append(line: &str, vocab: &Vocabulary, date: NaiveDate) -> String {
        match notation::locate(line, vocab) {
            Some(span) => format!(
                "{}{}{}",
                &line[..span.date_start],
                date.format(DATE_FORMAT),
                &line[span.date_end..]
            ),
            None => append_token(line, vocab.emoji, date),
        }
    }

    fn append_token(line: &str, emoji: &str, date: NaiveDate) -> String {
        format!("{} {} {}", line.trim_end(), emoji, date.format(DATE_FORMAT))
    }

    /* ---------------------------- File rewriting ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MutationOutcome {
        /// The line changed and the file was rewritten.
        Applied,
        /// The transform produced the same line; nothing was written.
        Unchanged,
        /// The transform could not be applied; the file was left untouched.
        TransformFailed(TransformError),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum MutationError {
        #[error("reading {path:?}")]
        Unreadable {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("writing {path:?}")]
        Unwritable {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("{path:?} has {lines} lines; line {line} does not exist")]
        LineOutOfRange {
            path: PathBuf,
            line: usize,
            lines: usize,
        },
    }

    /// Replace line `line` (1-based) of `path` with `transform` applied to it.
    pub fn apply_line_transform(
        path: &Path,
        line: usize,
        transform: &LineTransform,
        today: NaiveDate,
    ) -> Result<MutationOutcome, MutationError> {
        let content = fs::read_to_string(path).map_err(|source| MutationError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let idx = line
            .checked_sub(1)
            .filter(|idx| *idx < lines.len())
            .ok_or_else(|| MutationError::LineOutOfRange {
                path: path.to_path_buf(),
                line,
                lines: lines.len(),
            })?;

        let (body, ending) = split_line_ending(lines[idx]);
        let replacement = match transform.apply(body, today) {
            Ok(replacement) => replacement,
            Err(err) => {
                warn!(path = %path.display(), line, error = %err, "transform failed, line left unchanged");
                return Ok(MutationOutcome::TransformFailed(err));
            }
        };
        if replacement == body {
            debug!(path = %path.display(), line, "line already up to date");
            return Ok(MutationOutcome::Unchanged);
        }

        let mut out = String::with_capacity(content.len() + replacement.len());
        for (i, raw) in lines.iter().enumerate() {
            if i == idx {
                out.push_str(&replacement);
                out.push_str(ending);
            } else {
                out.push_str(raw);
            }
        }
        write_atomic(path, &out)?;
        debug!(path = %path.display(), line, "rewrote line");
        Ok(MutationOutcome::Applied)
    }

    fn split_line_ending(raw: &str) -> (&str, &str) {
        if let Some(body) = raw.strip_suffix("\r\n") {
            (body, "\r\n")
        } else if let Some(body) = raw.strip_suffix('\n') {
            (body, "\n")
        } else {
            (raw, "")
        }
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<(), MutationError> {
        let unwritable = |source| MutationError::Unwritable {
            path: path.to_path_buf(),
            source,
        };
        // Symlinked notes are written through to the file they point at.
        let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(unwritable)?;
        tmp.write_all(contents.as_bytes()).map_err(unwritable)?;
        tmp.as_file().sync_all().map_err(unwritable)?;
        if let Ok(meta) = fs::metadata(&target) {
            fs::set_permissions(tmp.path(), meta.permissions()).map_err(unwritable)?;
        }
        tmp.persist(&target).map_err(|err| unwritable(err.error))?;
        Ok(())
    }

    /* ---------------------------- Change signal ---------------------------- */

    /// Emitted after a file was rewritten.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ChangeEvent {
        pub path: PathBuf,
        pub line: usize,
        /// Let the file watcher's own notification settle before rescanning.
        pub rescan_after: StdDuration,
    }

    pub trait ChangeListener {
        fn data_changed(&self, event: &ChangeEvent);
    }

}

pub mod scan {
    //! One orchestration pass: matcher -> parser -> snooze filter -> ranking.

    use crate::config::EngineConfig;
    use crate::core::Task;
    use crate::matcher::{LineMatcher, MatchClass, MatcherError};
    use crate::parser::parse_task;
    use crate::score::Scorer;
    use chrono::{DateTime, Local, NaiveDateTime};
    use indexmap::IndexMap;
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
    };
    use tracing::{debug, info, warn};

    /// File modification times, looked up at most once per file and dropped with the scan.
    #[derive(Debug, Default)]
    struct MtimeTable {
        entries: IndexMap<PathBuf, NaiveDateTime>,
    }

    impl MtimeTable {
        fn modified(&mut self, path: &Path, fallback: NaiveDateTime) -> NaiveDateTime {
            if let Some(mtime) = self.entries.get(path) {
                return *mtime;
            }
            let mtime = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .map(|time| DateTime::<Local>::from(time).naive_local())
                .unwrap_or_else(|err| {
                    debug!(path = %path.display(), error = %err, "no modification time");
                    fallback
                });
            self.entries.insert(path.to_path_buf(), mtime);
            mtime
        }
    }

    /// Ranked tasks under `root`. A matcher that cannot run yields no tasks.
    pub fn scan(
        root: &Path,
        now: NaiveDateTime,
        matcher: &dyn LineMatcher,
        config: &EngineConfig,
    ) -> Vec<Task> {
        let mut seen = HashSet::new();
        let mut mtimes = MtimeTable::default();
        let mut tasks = Vec::new();

        for class in MatchClass::ALL {
            let matches = match matcher.find(root, &[class], &config.exclude_globs) {
                Ok(matches) => matches,
                Err(MatcherError::ToolUnavailable { program }) => {
                    info!(%program, "line matcher unavailable, no tasks");
                    return Vec::new();
                }
                Err(err) => {
                    warn!(error = %err, "line matcher failed, no tasks");
                    return Vec::new();
                }
            };
            debug!(?class, count = matches.len(), "matched lines");

            for m in matches {
                if !seen.insert((m.relative_path.clone(), m.line)) {
                    continue;
                }
                let path = root.join(&m.relative_path);
                let mtime = mtimes.modified(&path, now);
                let task = parse_task(&path, &m.relative_path, m.line, &m.text, mtime, now);
                if task.is_snoozed(now) {
                    debug!(path = %m.relative_path, line = m.line, "snoozed");
                    continue;
                }
                tasks.push(task);
            }
        }

        Scorer::from_config(config).rank(tasks, now)
    }

    #[cfg(test)]
    pub(crate) mod tests {
        use super::*;
        use crate::core::{Status, Urgency};
        use crate::matcher::LineMatch;
        use crate::parser::checkbox;
        use chrono::NaiveDate;
        use std::cell::Cell;

        /// Walks the vault in-process and greps checkbox lines the way `rg` would.
        pub(crate) struct VaultMatcher;

        impl VaultMatcher {
            fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) {
                let mut entries: Vec<_> = fs::read_dir(dir)
                    .expect("read dir")
                    .map(|e| e.expect("entry").path())
                    .collect();
                entries.sort();
                for path in entries {
                    if path.is_dir() {
                        Self::walk(&path, root, out);
                    } else if path.extension().is_some_and(|e| e == "md") {
                        out.push(path.strip_prefix(root).expect("under root").to_path_buf());
                    }
                }
            }
        }

        impl LineMatcher for VaultMatcher {
            fn find(
                &self,
                root: &Path,
                classes: &[MatchClass],
                _excludes: &[String],
            ) -> Result<Vec<LineMatch>, MatcherError> {
                let mut files = Vec::new();
                Self::walk(root, root, &mut files);
                let mut out = Vec::new();
                for rel in files {
                    let text = fs::read_to_string(root.join(&rel)).expect("read note");
                    for (idx, line) in text.lines().enumerate() {
                        let Some(cb) = checkbox(line) else { continue };
                        if classes.iter().any(|c| c.accepts_mark(cb.mark)) {
                            out.push(LineMatch {
                                relative_path: rel.to_string_lossy().into_owned(),
                                line: idx + 1,
                                text: line.to_string(),
                            });
                        }
                    }
                }
                Ok(out)
            }
        }

        struct Unavailable {
            calls: Cell<usize>,
        }

        impl LineMatcher for Unavailable {
            fn find(
                &self,
                _root: &Path,
                _classes: &[MatchClass],
                _excludes: &[String],
            ) -> Result<Vec<LineMatch>, MatcherError> {
                self.calls.set(self.calls.get() + 1);
                Err(MatcherError::ToolUnavailable {
                    program: "rg".into(),
                })
            }
        }

        /// Reports the same line for every class.
        struct Repeating;

        impl LineMatcher for Repeating {
            fn find(
                &self,
                _root: &Path,
                _classes: &[MatchClass],
                _excludes: &[String],
            ) -> Result<Vec<LineMatch>, MatcherError> {
                Ok(vec![LineMatch {
                    relative_path: "a.md".into(),
                    line: 1,
                    text: "- [ ] same".into(),
                }])
            }
        }

        fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
        }

        fn vault() -> tempfile::TempDir {
            let dir = tempfile::tempdir().expect("tempdir");
            fs::create_dir_all(dir.path().join("projects")).expect("mkdir");
            fs::write(
                dir.path().join("inbox.md"),
                "# Inbox\n- [ ] Pay rent 📅 2024-03-01\n- [ ] Someday\n- [ ] Later thing 💤 2024-03-20\n",
            )
            .expect("write inbox");
            fs::write(
                dir.path().join("projects/release.md"),
                "- [/] Ship release 🔺 📅 2024-03-16\n- [x] Tag build ✅ 2024-03-14\n- [-] Dropped\n",
            )
            .expect("write release");
            dir
        }

        #[test]
        fn scan_orders_by_urgency_and_hides_snoozed() {
            let dir = vault();
            let tasks = scan(dir.path(), at(2024, 3, 15), &VaultMatcher, &EngineConfig::default());
            let order: Vec<_> = tasks.iter().map(|t| (t.title(), t.urgency)).collect();
            assert_eq!(
                order,
                vec![
                    ("Pay rent".to_string(), Urgency::Overdue),
                    ("Ship release".to_string(), Urgency::Tomorrow),
                    ("Tag build".to_string(), Urgency::None),
                    ("Someday".to_string(), Urgency::None),
                ]
            );
            let release = &tasks[1];
            assert_eq!(release.status, Status::InProgress);
            assert_eq!(release.path, dir.path().join("projects/release.md"));
            assert_eq!(release.line, 1);
            assert!(tasks.iter().all(|t| t.status != Status::Cancelled));
        }

        #[test]
        fn snoozed_task_returns_once_the_date_passes() {
            let dir = vault();
            let config = EngineConfig::default();
            let hidden = scan(dir.path(), at(2024, 3, 20), &VaultMatcher, &config);
            assert!(hidden.iter().all(|t| t.title() != "Later thing"));

            let back = scan(dir.path(), at(2024, 3, 21), &VaultMatcher, &config);
            let task = back
                .iter()
                .find(|t| t.title() == "Later thing")
                .expect("snooze expired");
            assert_eq!(task.line, 4);
        }

        #[test]
        fn done_tasks_always_have_completion() {
            let dir = vault();
            fs::write(dir.path().join("log.md"), "- [X] no stamp\n").expect("write log");
            let tasks = scan(dir.path(), at(2024, 3, 15), &VaultMatcher, &EngineConfig::default());
            let done: Vec<_> = tasks.iter().filter(|t| t.status == Status::Done).collect();
            assert_eq!(done.len(), 2);
            assert!(done.iter().all(|t| t.completed_at.is_some()));
        }

        #[test]
        fn unavailable_matcher_gives_empty_scan() {
            let matcher = Unavailable { calls: Cell::new(0) };
            let tasks = scan(Path::new("/nowhere"), at(2024, 3, 15), &matcher, &EngineConfig::default());
            assert!(tasks.is_empty());
            assert_eq!(matcher.calls.get(), 1);
        }

        #[test]
        fn duplicate_matches_are_parsed_once() {
            let dir = tempfile::tempdir().expect("tempdir");
            let tasks = scan(dir.path(), at(2024, 3, 15), &Repeating, &EngineConfig::default());
            assert_eq!(tasks.len(), 1);
        }
    }
}

pub mod engine {
    //! Facade tying scanning and mutation to one configuration.

    use crate::bucket::{Dashboard, bucketize};
    use crate::config::EngineConfig;
    use crate::core::Task;
    use crate::matcher::LineMatcher;
    use crate::mutate::{
        ChangeEvent, ChangeListener, LineTransform, MutationError, MutationOutcome,
        apply_line_transform,
    };
    use crate::scan;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::path::Path;
    use tracing::{info, warn};

    pub struct Engine<M> {
        config: EngineConfig,
        matcher: M,
        listeners: Vec<Box<dyn ChangeListener>>,
    }

    impl<M: LineMatcher> Engine<M> {
        pub fn new(config: EngineConfig, matcher: M) -> Self {
            Self {
                config,
                matcher,
                listeners: Vec::new(),
            }
        }

        pub fn with_listener(mut self, listener: impl ChangeListener + 'static) -> Self {
            self.listeners.push(Box::new(listener));
            self
        }

        pub fn config(&self) -> &EngineConfig {
            &self.config
        }

        pub fn scan(&self, root: &Path, now: NaiveDateTime) -> Vec<Task> {
            scan::scan(root, now, &self.matcher, &self.config)
        }

        pub fn dashboard(&self, root: &Path, now: NaiveDateTime) -> Dashboard {
            bucketize(&self.scan(root, now), self.config.group_cap)
        }

        /// Rewrite one line; listeners hear about it only when the file changed.
        pub fn mutate(
            &self,
            path: &Path,
            line: usize,
            transform: &LineTransform,
            today: NaiveDate,
        ) -> Result<MutationOutcome, MutationError> {
            let outcome = apply_line_transform(path, line, transform, today).inspect_err(|err| {
                warn!(error = %err, "mutation failed");
            })?;
            if outcome == MutationOutcome::Applied {
                let event = ChangeEvent {
                    path: path.to_path_buf(),
                    line,
                    rescan_after: self.config.rescan_settle,
                };
                for listener in &self.listeners {
                    listener.data_changed(&event);
                }
            }
            Ok(outcome)
        }

        pub fn mutate_task(
            &self,
            task: &Task,
            transform: &LineTransform,
            today: NaiveDate,
        ) -> Result<MutationOutcome, MutationError> {
            self.mutate(&task.path, task.line, transform, today)
        }
    }

    /// Logs change events; for hosts that rescan on their own schedule.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TracingListener;

    impl ChangeListener for TracingListener {
        fn data_changed(&self, event: &ChangeEvent) {
            info!(
                path = %event.path.display(),
                line = event.line,
                rescan_after_ms = event.rescan_after.as_millis() as u64,
                "task data changed"
            );
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::bucket::GroupKind;
        use crate::core::Status;
        use crate::scan::tests::VaultMatcher;
        use std::{cell::RefCell, fs, rc::Rc};

        #[derive(Clone, Default)]
        struct Recorder(Rc<RefCell<Vec<ChangeEvent>>>);

        impl ChangeListener for Recorder {
            fn data_changed(&self, event: &ChangeEvent) {
                self.0.borrow_mut().push(event.clone());
            }
        }

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
        }

        #[test]
        fn completing_a_task_moves_it_to_done_on_rescan() {
            let dir = tempfile::tempdir().expect("tempdir");
            fs::write(
                dir.path().join("inbox.md"),
                "- [ ] Pay rent 📅 2024-03-01\n- [ ] Call bank 📅 2024-03-15\n",
            )
            .expect("write");
            let recorder = Recorder::default();
            let engine =
                Engine::new(EngineConfig::default(), VaultMatcher).with_listener(recorder.clone());

            let before = engine.dashboard(dir.path(), now());
            assert_eq!(before.overdue, 1);
            assert_eq!(before.due_today, 1);
            let rent = before.group(GroupKind::Overdue).unwrap().tasks[0].clone();

            let outcome = engine
                .mutate_task(&rent, &LineTransform::SetStatus(Status::Done), now().date())
                .expect("mutate");
            assert_eq!(outcome, MutationOutcome::Applied);
            let events = recorder.0.borrow().clone();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].line, 1);
            assert_eq!(events[0].rescan_after, engine.config().rescan_settle);

            let after = engine.dashboard(dir.path(), now());
            assert_eq!(after.overdue, 0);
            assert!(after.group(GroupKind::Overdue).is_none());
            let done = after.group(GroupKind::Done).unwrap();
            assert_eq!(done.tasks[0].title(), "Pay rent");
        }

        #[test]
        fn unchanged_and_failed_mutations_stay_quiet() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("inbox.md");
            fs::write(&path, "- [x] Done ✅ 2024-03-01\n").expect("write");
            let recorder = Recorder::default();
            let engine =
                Engine::new(EngineConfig::default(), VaultMatcher).with_listener(recorder.clone());

            let outcome = engine
                .mutate(&path, 1, &LineTransform::SetStatus(Status::Done), now().date())
                .expect("mutate");
            assert_eq!(outcome, MutationOutcome::Unchanged);

            let err = engine.mutate(
                &dir.path().join("missing.md"),
                1,
                &LineTransform::SetStatus(Status::Done),
                now().date(),
            );
            assert!(err.is_err());
            assert!(recorder.0.borrow().is_empty());
        }
    }
}

pub use bucket::{Dashboard, bucketize};
pub use engine::Engine;
pub use mutate::{LineTransform, apply_line_transform};
pub use parser::parse_task;
pub use scan::scan;
