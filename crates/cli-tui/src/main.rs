use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use relay::jobs::{JobClient, JobRole, JobStatus, JobSummary, KubeConfig, KubeJobClient};
use std::io::stdout;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

const REFRESH_EVERY: Duration = Duration::from_secs(3);

struct App {
    jobs: Vec<JobSummary>,
    table_state: TableState,
    should_quit: bool,
    namespace: String,
    api_url: String,
    last_refresh: Option<Instant>,
    last_error: Option<String>,
}

impl App {
    fn new(namespace: String, api_url: String) -> Self {
        Self {
            jobs: Vec::new(),
            table_state: TableState::default(),
            should_quit: false,
            namespace,
            api_url,
            last_refresh: None,
            last_error: None,
        }
    }

    fn due(&self) -> bool {
        self.last_refresh.map_or(true, |at| at.elapsed() >= REFRESH_EVERY)
    }

    fn refresh(&mut self, rt: &Runtime, client: &KubeJobClient) {
        match rt.block_on(client.list(&self.namespace)) {
            Ok(mut jobs) => {
                // Newest first
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.jobs = jobs;
                self.last_error = None;
            }
            Err(e) => {
                // Keep showing the last good listing
                self.last_error = Some(e.to_string());
            }
        }
        self.last_refresh = Some(Instant::now());
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    fn count_by_role(&self, role: JobRole) -> usize {
        self.jobs.iter().filter(|j| j.role() == Some(role)).count()
    }
}

/// Read-only view of the pipeline's jobs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to list jobs from (defaults to the client's namespace)
    #[arg(short, long)]
    namespace: Option<String>,

    /// API server URL, overriding in-cluster configuration
    #[arg(long, env = "KUBE_API_URL")]
    api_url: Option<String>,

    /// Bearer token for --api-url
    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut kube = match &args.api_url {
        Some(url) => KubeConfig::new(url.clone()),
        None => KubeConfig::in_cluster().context("Failed to load cluster configuration")?,
    };
    if let Some(token) = args.token {
        kube = kube.with_token(token);
    }
    let namespace = args.namespace.unwrap_or_else(|| kube.namespace.clone());
    let api_url = kube.base_url.clone();
    let client = KubeJobClient::new(kube).context("Failed to create the job client")?;
    let rt = Runtime::new().context("Failed to start the async runtime")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(namespace, api_url);

    loop {
        if app.due() {
            app.refresh(&rt, &client);
        }

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh(&rt, &client);
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 60 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 60x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let top_height = 3;
    let bottom_height = 3;
    let available_height = size.height.saturating_sub(top_height + bottom_height);

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(top_height),
            Constraint::Length(available_height),
            Constraint::Length(bottom_height),
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_job_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let target = Paragraph::new(format!("{} @ {}", app.namespace, truncate_string(&app.api_url, 40)))
        .block(Block::default().borders(Borders::ALL).title("Namespace"));
    f.render_widget(target, chunks[0]);

    let roles = Paragraph::new(format!(
        "transcode: {}  upload: {}",
        app.count_by_role(JobRole::Transcode),
        app.count_by_role(JobRole::Upload)
    ))
    .block(Block::default().borders(Borders::ALL).title("Pipeline"));
    f.render_widget(roles, chunks[1]);
}

fn status_label(status: JobStatus) -> (&'static str, Color) {
    match status {
        JobStatus::Pending => ("PEND", Color::Yellow),
        JobStatus::Running => ("RUN", Color::Cyan),
        JobStatus::Succeeded => ("OK", Color::Green),
        JobStatus::Failed => ("FAIL", Color::Red),
        JobStatus::Deleted => ("DEL", Color::DarkGray),
    }
}

/// Seconds, minutes or hours, whichever reads best
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 120 {
        format!("{}s", secs)
    } else if secs < 2 * 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    if area.height < 3 {
        let error_msg = Paragraph::new("Not enough space")
            .block(Block::default().borders(Borders::ALL).title("Jobs"));
        f.render_widget(error_msg, area);
        return;
    }

    // Top border, header and bottom border
    let max_data_rows = (area.height as usize).saturating_sub(3);
    let now: DateTime<Utc> = Utc::now();

    let header = Row::new(vec!["ST", "JOB", "ROLE", "AGE", "TIME"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            format!("No jobs in {}", app.namespace),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])
        .height(1)]
    } else {
        app.jobs
            .iter()
            .take(max_data_rows)
            .map(|job| {
                let (label, color) = status_label(job.status);
                let role = job.role().map(|r| r.as_str()).unwrap_or("-");
                let age = job
                    .created_at
                    .map(|created| format_age(now - created))
                    .unwrap_or_else(|| "-".to_string());
                let duration = job
                    .duration(now)
                    .map(format_age)
                    .unwrap_or_else(|| "-".to_string());

                Row::new(vec![
                    label.to_string(),
                    truncate_string(&job.name, 63),
                    role.to_string(),
                    age,
                    duration,
                ])
                .style(Style::default().fg(color))
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(60),
        Constraint::Length(10),
        Constraint::Length(6),
        Constraint::Length(6),
    ];

    let title = format!("Jobs ({}/{})", rows.len().min(app.jobs.len()), app.jobs.len());

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let status_text = match &app.last_error {
        Some(err) => format!("Refresh failed: {} | q=quit r=refresh", truncate_string(err, 80)),
        None => format!(
            "Total: {} | Running: {} | Pending: {} | Succeeded: {} | Failed: {} | q=quit r=refresh",
            app.jobs.len(),
            app.count_by_status(JobStatus::Running),
            app.count_by_status(JobStatus::Pending),
            app.count_by_status(JobStatus::Succeeded),
            app.count_by_status(JobStatus::Failed),
        ),
    };
    let style = if app.last_error.is_some() {
        Style::default().fg(Color::Red)
    } else {
        Style::default()
    };

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(style)
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
