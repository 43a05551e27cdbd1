//! Command line builders for external tools.
//!
//! Every token placed on a command line goes through
//! [`vplay_models::sanitize_for_shell`], so URLs and paths coming from
//! untrusted input can never split into extra arguments or chain commands.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vplay_models::sanitize_for_shell;

/// Logical tool name of the metadata extractor.
pub const EXTRACTOR_TOOL: &str = "yt-dlp";

/// Logical tool name of the transcoder.
pub const TRANSCODER_TOOL: &str = "ffmpeg";

/// A single argument string made of individually quoted tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.tokens.push(sanitize_for_shell(arg.as_ref()));
        self
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tokens
            .extend(args.into_iter().map(|a| sanitize_for_shell(a.as_ref())));
        self
    }

    /// Append a path argument.
    pub fn path(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.arg(path)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Render the argument string handed to the executor.
    pub fn render(&self) -> String {
        self.tokens.join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// FFmpeg stream-copy (remux) command: no re-encoding.
#[derive(Debug, Clone)]
pub struct RemuxCommand {
    /// Input URL or path
    input: String,
    /// Output file path
    output: PathBuf,
    /// Log level
    log_level: String,
}

impl RemuxCommand {
    pub fn new(input: impl Into<String>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.into(),
            output: output.as_ref().to_path_buf(),
            log_level: "error".to_string(),
        }
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the command line.
    pub fn build(&self) -> CommandLine {
        CommandLine::new()
            .args(["-y", "-nostdin", "-v"])
            .arg(&self.log_level)
            .arg("-i")
            .arg(&self.input)
            .args(["-map", "0", "-c", "copy"])
            .path(&self.output)
    }
}

/// yt-dlp metadata extraction command (single JSON document on stdout).
#[derive(Debug, Clone)]
pub struct ExtractCommand {
    url: String,
    format: Option<String>,
    socket_timeout: Option<Duration>,
}

impl ExtractCommand {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
            socket_timeout: None,
        }
    }

    /// Restrict the format selection (yt-dlp `-f`).
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Network timeout used by the extractor for each request.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Build the command line.
    pub fn build(&self) -> CommandLine {
        let mut cmd = CommandLine::new().args([
            "--dump-single-json",
            "--no-playlist",
            "--no-warnings",
        ]);

        if let Some(format) = &self.format {
            cmd = cmd.arg("-f").arg(format);
        }

        if let Some(timeout) = self.socket_timeout {
            cmd = cmd
                .arg("--socket-timeout")
                .arg(timeout.as_secs().max(1).to_string());
        }

        // `--` stops option parsing so a URL starting with `-` stays a URL
        cmd.arg("--").arg(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(cmd: &CommandLine) -> Vec<String> {
        shell_words::split(&cmd.render()).unwrap()
    }

    #[test]
    fn test_command_line_quotes_every_token() {
        let cmd = CommandLine::new()
            .arg("-i")
            .arg("https://x.com/v?a=1&b=2; rm -rf ~")
            .arg("")
            .path("/tmp/my dir/out file.mp4");

        assert_eq!(
            split(&cmd),
            vec![
                "-i",
                "https://x.com/v?a=1&b=2; rm -rf ~",
                "",
                "/tmp/my dir/out file.mp4"
            ]
        );
        assert!(cmd.render().starts_with("-i 'https://"));
    }

    #[test]
    fn test_remux_command() {
        let cmd = RemuxCommand::new("https://cdn.example.com/v.m3u8?sig=a'b", "/work/abc.mp4").build();
        assert_eq!(
            split(&cmd),
            vec![
                "-y",
                "-nostdin",
                "-v",
                "error",
                "-i",
                "https://cdn.example.com/v.m3u8?sig=a'b",
                "-map",
                "0",
                "-c",
                "copy",
                "/work/abc.mp4"
            ]
        );
    }

    #[test]
    fn test_extract_command() {
        let cmd = ExtractCommand::new("-https://evil")
            .format("best")
            .socket_timeout(Duration::from_millis(200))
            .build();
        let args = split(&cmd);
        assert_eq!(&args[..3], ["--dump-single-json", "--no-playlist", "--no-warnings"]);
        assert!(args.windows(2).any(|w| w == ["-f", "best"]));
        assert!(args.windows(2).any(|w| w == ["--socket-timeout", "1"]));
        assert_eq!(&args[args.len() - 2..], ["--", "-https://evil"]);
    }
}
