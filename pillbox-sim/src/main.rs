use anyhow::Result;
use clap::Parser;
use pillbox_shared::protocol::REMINDER_PREFIX;
use pillbox_shared::{DoseSchedule, Period, ScheduleTime};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pillbox-sim")]
#[command(about = "Pill box firmware simulator for the TCP transport mode")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Seconds between reminder lines once a time is set
    #[arg(long, default_value = "30")]
    reminder_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.listen).await?;
    info!("[SIM] Pill box listening on {}", args.listen);

    let every = Duration::from_secs(args.reminder_secs);
    loop {
        let (socket, addr) = listener.accept().await?;
        info!("[SIM] Client connected: {}", addr);
        tokio::spawn(async move {
            match handle_client(socket, every).await {
                Ok(()) => info!("[SIM] Client {} disconnected", addr),
                Err(e) => error!("[SIM] Client {}: {}", addr, e),
            }
        });
    }
}

async fn handle_client(socket: TcpStream, reminder_every: Duration) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut schedule = DoseSchedule::default();
    let mut cursor = 0usize;
    let mut ticker = interval_at(Instant::now() + reminder_every, reminder_every);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                debug!("[SIM] <- {:?}", line);
                if let Some(reply) = respond(&mut schedule, &line) {
                    writer.write_all(reply.as_bytes()).await?;
                }
            }
            _ = ticker.tick() => {
                if let Some(reminder) = next_reminder(&schedule, &mut cursor) {
                    info!("[SIM] -> {}", reminder.trim_end());
                    writer.write_all(reminder.as_bytes()).await?;
                }
            }
        }
    }
}

/// Reply to one command line, as the firmware would
fn respond(schedule: &mut DoseSchedule, line: &str) -> Option<String> {
    let (tag, time) = line.trim().split_once(':')?;
    let mut chars = tag.chars();
    let period = Period::from_tag(chars.next()?)?;
    if chars.next().is_some() {
        return None;
    }

    match time.parse::<ScheduleTime>() {
        Ok(time) => {
            info!("[SIM] {} time set to {}", period, time);
            schedule.set(period, time);
            Some(format!("{}\n", period.acknowledgement()))
        }
        Err(e) => Some(format!("Error: {}\n", e)),
    }
}

/// Round-robin over the periods that have a time set
fn next_reminder(schedule: &DoseSchedule, cursor: &mut usize) -> Option<String> {
    for _ in 0..Period::ALL.len() {
        let period = Period::ALL[*cursor % Period::ALL.len()];
        *cursor += 1;
        if let Some(time) = schedule.get(period) {
            return Some(format!(
                "{} Time to take your {} medicine ({})\n",
                REMINDER_PREFIX,
                period.to_string().to_lowercase(),
                time
            ));
        }
    }
    None
}
