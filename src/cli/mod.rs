use crate::engine::Command;
use crate::models::LoopMode;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub mod status;
pub use status::StatusDisplay;

/// Streaming music daemon
#[derive(Debug, Parser)]
#[command(name = "streamplayd")]
#[command(about = "A background music daemon that streams Ogg/Vorbis tracks from network backends")]
#[command(version)]
pub struct CliApp {
    /// Configuration file (defaults to ~/.config/streamplay/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Start by playing this track
    #[arg(long, conflicts_with_all = ["album", "playlist"])]
    pub track: Option<String>,

    /// Start by playing this album
    #[arg(long, conflicts_with = "playlist")]
    pub album: Option<String>,

    /// Start by playing this playlist
    #[arg(long)]
    pub playlist: Option<String>,

    /// Audio output device name
    #[arg(short, long)]
    pub device: Option<String>,

    /// List audio output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// List cached albums and playlists and exit
    #[arg(long)]
    pub list_playlists: bool,
}

/// One line read from the control input
#[derive(Debug)]
pub enum ControlLine {
    Engine(Command),
    Status,
    Help,
    Quit,
}

impl CliApp {
    /// Parse command line arguments
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Command for the playback requested on the command line, if any
    pub fn initial_command(&self) -> Option<Command> {
        if let Some(id) = &self.track {
            return Some(Command::PlayTrack(id.clone()));
        }
        if let Some(id) = &self.album {
            return Some(Command::PlayAlbum(id.clone()));
        }
        self.playlist.as_ref().map(|id| Command::PlayPlaylist(id.clone()))
    }

    /// Parse one control line
    pub fn parse_command(input: &str) -> Result<ControlLine, ParseError> {
        let args: Vec<&str> = input.split_whitespace().collect();
        if args.is_empty() {
            return Err(ParseError::EmptyCommand);
        }

        let arg = |name: &str| argument(&args, name);

        let command = match args[0] {
            "play-track" => Command::PlayTrack(arg("id")?.to_string()),
            "play-album" => Command::PlayAlbum(arg("id")?.to_string()),
            "play-playlist" => Command::PlayPlaylist(arg("id")?.to_string()),
            "play" | "resume" => Command::Play,
            "pause" => Command::Pause,
            "toggle" | "play-pause" => Command::PlayPause,
            "stop" => Command::Stop,
            "next" => Command::Next,
            "prev" | "previous" => Command::Previous,
            "seek" => Self::parse_seek(arg("position")?)?,
            "volume" => {
                let value = arg("level")?;
                match value.parse::<u8>() {
                    Ok(level) if level <= 100 => Command::SetVolume(level as f32 / 100.0),
                    _ => {
                        return Err(ParseError::InvalidArgument {
                            argument: "volume level".to_string(),
                            value: value.to_string(),
                            expected: "0-100".to_string(),
                        })
                    }
                }
            }
            "shuffle" => match arg("on|off")? {
                "on" => Command::SetShuffle(true),
                "off" => Command::SetShuffle(false),
                other => {
                    return Err(ParseError::InvalidArgument {
                        argument: "shuffle".to_string(),
                        value: other.to_string(),
                        expected: "on or off".to_string(),
                    })
                }
            },
            "loop" => {
                let value = arg("mode")?;
                match LoopMode::parse(value) {
                    Some(mode) => Command::SetLoopMode(mode),
                    None => {
                        return Err(ParseError::InvalidArgument {
                            argument: "loop mode".to_string(),
                            value: value.to_string(),
                            expected: "none, track or playlist".to_string(),
                        })
                    }
                }
            }
            "status" => return Ok(ControlLine::Status),
            "help" => return Ok(ControlLine::Help),
            "quit" | "exit" => return Ok(ControlLine::Quit),
            _ => {
                return Err(ParseError::UnknownCommand {
                    command: args[0].to_string(),
                })
            }
        };

        Ok(ControlLine::Engine(command))
    }

    /// "+10", "-5s" seek relative to the current position, "1:30" is absolute
    fn parse_seek(input: &str) -> Result<Command, ParseError> {
        if let Some(rest) = input.strip_prefix('+') {
            let offset = Self::parse_time(rest)?;
            return Ok(Command::SeekRelative(offset.as_micros().min(i64::MAX as u128) as i64));
        }
        if let Some(rest) = input.strip_prefix('-') {
            let offset = Self::parse_time(rest)?;
            return Ok(Command::SeekRelative(-(offset.as_micros().min(i64::MAX as u128) as i64)));
        }
        let position = Self::parse_time(input)?;
        Ok(Command::SeekAbsolute(position.as_micros().min(u64::MAX as u128) as u64))
    }

    /// Parse time string to Duration
    pub fn parse_time(time_str: &str) -> Result<Duration, ParseError> {
        let trimmed = time_str.trim();
        let invalid = || ParseError::InvalidTimeFormat {
            input: time_str.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid());
        }

        // "1:30", "1:30.5", "90", "90s"
        let seconds = if let Some((minutes, seconds)) = trimmed.split_once(':') {
            let minutes: u64 = minutes.parse().map_err(|_| invalid())?;
            let seconds: f64 = seconds.parse().map_err(|_| invalid())?;
            if !(0.0..60.0).contains(&seconds) {
                return Err(invalid());
            }
            minutes as f64 * 60.0 + seconds
        } else {
            let seconds: f64 = trimmed.trim_end_matches('s').parse().map_err(|_| invalid())?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(invalid());
            }
            seconds
        };

        Ok(Duration::from_secs_f64(seconds))
    }

    /// Format duration for display
    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        format!("{:02}:{:02}", minutes, seconds)
    }

    /// Display help information
    pub fn display_help() {
        println!("streamplay - Available Commands:");
        println!();
        println!("Playback:");
        println!("  play-track <id>     - Play a single track");
        println!("  play-album <id>     - Play an album");
        println!("  play-playlist <id>  - Play a playlist");
        println!("  play | pause        - Resume or pause playback");
        println!("  toggle              - Toggle between play and pause");
        println!("  stop                - Stop playback");
        println!("  next | prev         - Next or previous track");
        println!("  seek <time>         - Seek to '1:30', or by '+10' / '-5s'");
        println!();
        println!("Settings:");
        println!("  volume <0-100>      - Set volume level");
        println!("  shuffle on|off      - Toggle shuffle");
        println!("  loop none|track|playlist");
        println!();
        println!("General:");
        println!("  status              - Show current player status");
        println!("  help                - Show this help message");
        println!("  quit, exit          - Shut the daemon down");
    }
}

/// Second word of a control line
fn argument<'a>(args: &[&'a str], name: &str) -> Result<&'a str, ParseError> {
    args.get(1).copied().ok_or_else(|| ParseError::MissingArgument {
        command: args.first().copied().unwrap_or_default().to_string(),
        argument: name.to_string(),
    })
}

/// Command parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Missing argument for {command}: {argument}")]
    MissingArgument { command: String, argument: String },

    #[error("Invalid argument {argument}: got '{value}', expected {expected}")]
    InvalidArgument {
        argument: String,
        value: String,
        expected: String,
    },

    #[error("Invalid time format: {input}")]
    InvalidTimeFormat { input: String },
}
