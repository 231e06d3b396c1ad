//! Interactive terminal output, behind the `tui` cargo feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use ratatui::crossterm::event::{self, Event, KeyCode};
use ratatui::layout::{Constraint, Layout};
use ratatui::widgets::{Block, Paragraph, Row, Table};
use ratatui::Frame;

use crate::live_run::LiveSnapshot;
use crate::render::Report;

/// Show a finished static-mode report until the user quits.
pub fn show_report(report: &Report) -> anyhow::Result<()> {
    let mut terminal = ratatui::init();
    loop {
        terminal.draw(|frame| draw_report(frame, report))?;
        if event::poll(Duration::from_millis(250))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    ratatui::restore();
    Ok(())
}

/// Redraw the live snapshot until shutdown or the user quits.
pub fn run_live(snapshot: Arc<ArcSwap<LiveSnapshot>>, shutdown: Arc<AtomicBool>) {
    let mut terminal = ratatui::init();
    while !shutdown.load(Ordering::Relaxed) {
        let snap = snapshot.load_full();
        if terminal.draw(|frame| draw_live(frame, &snap)).is_err() {
            break;
        }
        if let Ok(true) = event::poll(Duration::from_millis(250)) {
            if let Ok(Event::Key(key)) = event::read() {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    shutdown.store(true, Ordering::Relaxed);
                }
            }
        }
    }
    ratatui::restore();
}

fn draw_report(frame: &mut Frame, report: &Report) {
    let [header, matches_area, bans_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(5),
        Constraint::Length(8),
    ])
    .areas(frame.area());

    let summary = Paragraph::new(format!(
        "{} requests parsed, {} malformed (press q to quit)",
        report.parsed, report.malformed
    ));
    frame.render_widget(summary, header);

    let mut rows = Vec::new();
    for trie in &report.tries {
        for recipe_report in &trie.recipes {
            for m in &recipe_report.matches {
                rows.push(Row::new(vec![
                    trie.name.clone(),
                    m.cidr.to_string(),
                    m.count.to_string(),
                    format!("{:.2}%", m.percentage * 100.0),
                ]));
            }
        }
    }
    frame.render_widget(match_table(rows), matches_area);
    frame.render_widget(ban_table(report.active_bans.iter()), bans_area);
}

fn draw_live(frame: &mut Frame, snapshot: &LiveSnapshot) {
    let [header, windows_area, matches_area, bans_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(6),
        Constraint::Min(5),
        Constraint::Length(8),
    ])
    .areas(frame.area());

    let updated = snapshot
        .updated
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let summary = Paragraph::new(format!(
        "last cycle {} | {} malformed lines (press q to quit)",
        updated, snapshot.malformed_lines
    ));
    frame.render_widget(summary, header);

    let window_rows: Vec<Row> = snapshot
        .windows
        .iter()
        .map(|w| Row::new(vec![w.name.clone(), w.resident.to_string()]))
        .collect();
    let windows = Table::new(
        window_rows,
        [Constraint::Length(24), Constraint::Length(12)],
    )
    .header(Row::new(vec!["window", "resident"]))
    .block(Block::bordered().title("sliding windows"));
    frame.render_widget(windows, windows_area);

    let rows: Vec<Row> = snapshot
        .recent_matches
        .iter()
        .rev()
        .map(|m| {
            Row::new(vec![
                m.window.clone(),
                m.cidr.to_string(),
                m.count.to_string(),
                format!("{:.2}%", m.percentage * 100.0),
            ])
        })
        .collect();
    frame.render_widget(match_table(rows), matches_area);
    frame.render_widget(ban_table(snapshot.active_bans.iter()), bans_area);
}

fn match_table(rows: Vec<Row<'_>>) -> Table<'_> {
    Table::new(
        rows,
        [
            Constraint::Length(24),
            Constraint::Length(20),
            Constraint::Length(12),
            Constraint::Length(9),
        ],
    )
    .header(Row::new(vec!["window", "cidr", "requests", "share"]))
    .block(Block::bordered().title("detected ranges"))
}

fn ban_table<'a>(bans: impl Iterator<Item = &'a cidrwatch_net::Cidr>) -> Table<'a> {
    let rows: Vec<Row> = bans.map(|c| Row::new(vec![c.to_string()])).collect();
    Table::new(rows, [Constraint::Length(20)])
        .header(Row::new(vec!["active bans"]))
        .block(Block::bordered().title("jail"))
}
