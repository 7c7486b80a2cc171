use crate::output::{print_json, print_table};
use agrec_core::config::Config;
use agrec_core::source;
use anyhow::Context;
use serde::Serialize;

#[derive(Serialize)]
struct Upcoming {
    start: String,
    end: String,
    day: u8,
    title: String,
    duration_secs: i64,
    repeat: bool,
}

pub fn run(config: &Config, count: usize, json: bool) -> anyhow::Result<()> {
    let tz = config.tz()?;
    let source = source::from_location(config.timetable_location()?);
    let schedule = source
        .fetch()
        .with_context(|| format!("failed to read timetable from {}", source.describe()))?;

    let now = chrono::Utc::now().with_timezone(&tz);
    let upcoming: Vec<Upcoming> = schedule
        .take(count, &now)
        .into_iter()
        .map(|(start, program)| Upcoming {
            end: (start + chrono::Duration::seconds(program.duration_secs())).to_rfc3339(),
            start: start.to_rfc3339(),
            day: program.day(),
            title: program.recording_title(),
            duration_secs: program.duration_secs(),
            repeat: program.is_repeat(),
        })
        .collect();

    if json {
        return print_json(&upcoming);
    }
    if upcoming.is_empty() {
        println!("Timetable is empty.");
        return Ok(());
    }
    let rows = upcoming
        .iter()
        .map(|u| {
            vec![
                u.start.clone(),
                format!("{}m", u.duration_secs / 60),
                u.title.clone(),
            ]
        })
        .collect();
    print_table(&["START", "LENGTH", "TITLE"], rows);
    Ok(())
}
