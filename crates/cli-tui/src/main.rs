use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use humansize::{format_size, DECIMAL};
use pipeline::config::PipelineConfig;
use pipeline::model::{FileMetadataRecord, ProgressRecord, ProgressStatus, StoredItem};
use pipeline::store::load_all_items;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::collections::HashMap;
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;

/// One submission as shown in the table
struct JobRow {
    progress: ProgressRecord,
    file_name: Option<String>,
    size: Option<u64>,
}

struct App {
    rows: Vec<JobRow>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    state_dir: PathBuf,
}

impl App {
    fn new(state_dir: PathBuf) -> Self {
        Self {
            rows: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            state_dir,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_all();

        match load_all_items(&self.state_dir) {
            Ok(items) => self.rows = build_rows(items),
            // An unreadable state dir shows as an empty table
            Err(_) => self.rows = Vec::new(),
        }
    }

    fn count_by_status(&self, status: ProgressStatus) -> usize {
        self.rows.iter().filter(|r| r.progress.status == status).count()
    }
}

/// Join progress records with the file records that point at them, newest first
fn build_rows(items: Vec<StoredItem>) -> Vec<JobRow> {
    let mut files: HashMap<(String, String), FileMetadataRecord> = HashMap::new();
    let mut progress = Vec::new();
    for item in items {
        match item {
            StoredItem::File(f) => {
                files.insert((f.username.clone(), f.progress_id.clone()), f);
            }
            StoredItem::Progress(p) => progress.push(p),
            StoredItem::Activity(_) => {}
        }
    }

    let mut rows: Vec<JobRow> = progress
        .into_iter()
        .map(|p| {
            let file = files.get(&(p.username.clone(), p.tracking_id.clone()));
            JobRow {
                file_name: file.map(|f| f.file_name.clone()),
                size: file.and_then(|f| f.size),
                progress: p,
            }
        })
        .collect();
    rows.sort_by(|a, b| b.progress.last_updated.cmp(&a.progress.last_updated));
    rows
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_config_path = PathBuf::from("/etc/hevcd/config.toml");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = PipelineConfig::load_config(config_path).context("Failed to load configuration")?;

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg.state_dir.clone());

    loop {
        app.refresh();
        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(250))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => app.refresh(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(terminal.backend_mut(), crossterm::terminal::LeaveAlternateScreen)?;

    Ok(())
}

/// HEVC pipeline progress monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let total_memory = app.system.total_memory();
    let used_memory = app.system.used_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(used_memory as f64 / total_memory as f64 * 100.0)
    };
    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!(
            "{} / {}",
            format_size(used_memory, DECIMAL),
            format_size(total_memory, DECIMAL)
        ));
    f.render_widget(memory_gauge, chunks[1]);
}

fn status_label(status: ProgressStatus) -> &'static str {
    match status {
        ProgressStatus::Started => "START",
        ProgressStatus::Transcoding => "ENC",
        ProgressStatus::Completed => "OK",
        ProgressStatus::Error => "FAIL",
    }
}

fn status_color(status: ProgressStatus) -> Color {
    match status {
        ProgressStatus::Started => Color::Yellow,
        ProgressStatus::Transcoding => Color::Cyan,
        ProgressStatus::Completed => Color::Green,
        ProgressStatus::Error => Color::Red,
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "USER", "TRACKING ID", "FILE", "SIZE", "PROGRESS", "UPDATED"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = Utc::now();
    let rows: Vec<Row> = if app.rows.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("Dir: {}", app.state_dir.display()),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.rows
            .iter()
            .take(max_data_rows)
            .map(|row| {
                let p = &row.progress;
                let updated = format_age((now - p.last_updated).num_seconds());
                Row::new(vec![
                    status_label(p.status).to_string(),
                    truncate_string(&p.username, 16),
                    truncate_string(&p.tracking_id, 24),
                    truncate_string(row.file_name.as_deref().unwrap_or("?"), 40),
                    row.size.map(|b| format_size(b, DECIMAL)).unwrap_or_else(|| "-".to_string()),
                    progress_bar(p.percent, 10),
                    updated,
                ])
                .style(Style::default().fg(status_color(p.status)))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(16),
        Constraint::Length(24),
        Constraint::Percentage(40),
        Constraint::Length(9),
        Constraint::Length(16),
        Constraint::Length(9),
    ];

    let title = format!("Jobs ({}/{})", rows.len().min(app.rows.len()), app.rows.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let dir_display = app.state_dir.display().to_string();
    let status_text = format!(
        "Total: {} | Started: {} | Transcoding: {} | Completed: {} | Failed: {} | Dir: {} | q=quit r=refresh",
        app.rows.len(),
        app.count_by_status(ProgressStatus::Started),
        app.count_by_status(ProgressStatus::Transcoding),
        app.count_by_status(ProgressStatus::Completed),
        app.count_by_status(ProgressStatus::Error),
        truncate_string(&dir_display, 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// `#####-----  50%` style text bar
fn progress_bar(percent: u8, width: usize) -> String {
    let pct = percent.min(100) as usize;
    let filled = pct * width / 100;
    format!("{}{} {:>3}%", "#".repeat(filled), "-".repeat(width - filled), pct)
}

fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
