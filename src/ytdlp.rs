use std::{
    convert::Infallible,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use axum::body::{Body, Bytes};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{ApiError, params::DownloadRequest};

const AUDIO_ONLY: &str = "audio only";
const UNKNOWN_FILESIZE: &str = "N/A";
const BEST_FORMAT: &str = "best";
const SECTION_OUTPUT_TEMPLATE: &str =
    "%(title)s_%(section_start)s-%(section_end)s_%(epoch)s.%(ext)s";
const OUTPUT_CHANNEL_CAPACITY: usize = 32;
const FALLBACK_DURATION_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
pub struct YtDlpVideoInfo {
    #[serde(default, deserialize_with = "explicit_value")]
    title: Option<Value>,
    #[serde(default)]
    formats: Option<Vec<YtDlpFormat>>,
    #[serde(default)]
    duration: Option<Value>,
    #[serde(default)]
    duration_string: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct YtDlpFormat {
    #[serde(default, deserialize_with = "explicit_value")]
    format_id: Option<Value>,
    #[serde(default, deserialize_with = "explicit_value")]
    ext: Option<Value>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    width: Option<u64>,
    #[serde(default)]
    height: Option<u64>,
    #[serde(default)]
    format_note: Option<String>,
    #[serde(default)]
    filesize: Option<f64>,
    #[serde(default, deserialize_with = "explicit_value")]
    vcodec: Option<Value>,
    #[serde(default, deserialize_with = "explicit_value")]
    acodec: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,
    pub formats: Vec<FormatSummary>,
    pub duration: Number,
    pub duration_string: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FormatSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    pub resolution: String,
    pub note: String,
    pub filesize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<Value>,
}

// Absent stays `None` through `#[serde(default)]`; an explicit `null` becomes
// `Some(Value::Null)` and is echoed back.
fn explicit_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl YtDlpVideoInfo {
    /// Audio-only variants are dropped; the listing is for picking a video quality.
    pub fn into_formats_response(self) -> FormatsResponse {
        let formats = self
            .formats
            .unwrap_or_default()
            .into_iter()
            .map(summarize_format)
            .filter(|summary| summary.resolution != AUDIO_ONLY)
            .collect();

        let duration = match self.duration {
            Some(Value::Number(seconds)) if seconds.as_f64().is_some_and(|secs| secs != 0.0) => {
                seconds
            }
            _ => Number::from(FALLBACK_DURATION_SECS),
        };
        let duration_string = match self.duration_string {
            Some(Value::String(text)) if !text.is_empty() => text,
            _ => format_duration(duration.as_f64().unwrap_or_default()),
        };

        FormatsResponse {
            title: self.title,
            formats,
            duration,
            duration_string,
        }
    }
}

/// Whole seconds as `h:mm:ss`, or `mm:ss` under an hour.
fn format_duration(seconds: f64) -> String {
    let total = seconds as u64;
    let (hours, minutes, secs) = (total / 3600, total / 60 % 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

fn summarize_format(format: YtDlpFormat) -> FormatSummary {
    let resolution = format
        .resolution
        .filter(|value| !value.is_empty())
        .or_else(|| match (format.width, format.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(format!("{width}x{height}"))
            }
            _ => None,
        })
        .unwrap_or_else(|| AUDIO_ONLY.to_string());

    FormatSummary {
        format_id: format.format_id,
        ext: format.ext,
        resolution,
        note: format.format_note.unwrap_or_default(),
        filesize: format
            .filesize
            .filter(|bytes| *bytes > 0.0)
            .map(format_filesize_mb)
            .unwrap_or_else(|| UNKNOWN_FILESIZE.to_string()),
        vcodec: format.vcodec,
        acodec: format.acodec,
    }
}

// Ties round up, so 131072 bytes reads "0.13 MB".
fn format_filesize_mb(bytes: f64) -> String {
    let hundredths = (bytes / 1_048_576.0 * 100.0).round();
    format!("{:.2} MB", hundredths / 100.0)
}

pub fn section_download_args(request: &DownloadRequest) -> Vec<String> {
    vec![
        "-f".to_string(),
        request
            .format_id
            .clone()
            .unwrap_or_else(|| BEST_FORMAT.to_string()),
        request.url.clone(),
        "-o".to_string(),
        SECTION_OUTPUT_TEMPLATE.to_string(),
        "--download-sections".to_string(),
        format!("*{}-{}", request.start_time, request.end_time),
        "--force-keyframes-at-cuts".to_string(),
    ]
}

/// How to invoke the external downloader and where it runs.
#[derive(Debug, Clone)]
pub struct Downloader {
    program: String,
    leading_args: Vec<String>,
    work_dir: PathBuf,
}

impl Downloader {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>, work_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            leading_args,
            work_dir,
        }
    }

    /// Splits a command line such as `python3 -m yt_dlp` into program and leading arguments.
    pub fn from_command_line(command_line: &str, work_dir: PathBuf) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(ToString::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), work_dir))
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn describe(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.leading_args.iter().map(String::as_str))
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .current_dir(&self.work_dir);
        command
    }

    pub async fn dump_metadata(&self, url: &str) -> Result<YtDlpVideoInfo, ApiError> {
        let output = self
            .command(&["-J".to_string(), url.to_string()])
            .output()
            .await
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                "Downloader exited with code {} while fetching formats for {:?}",
                exit_code_label(output.status),
                url
            );
            return Err(ApiError::subprocess_failure(stderr));
        }

        serde_json::from_slice(&output.stdout).map_err(|error| {
            warn!("Could not parse downloader JSON for {:?}: {error}", url);
            ApiError::output_parse_failure(error.to_string())
        })
    }

    /// Spawns the downloader and returns a body that relays its stdout and
    /// stderr as they arrive, followed by the exit-code line.
    pub fn stream_output(&self, args: &[String]) -> Result<Body, ApiError> {
        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| self.spawn_error(error))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(self.spawn_error(io::Error::other("downloader pipes were not captured")));
        };

        let download_id = Uuid::new_v4();
        info!(%download_id, pid = ?child.id(), "Downloader started");

        let (sender, receiver) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        tokio::spawn(relay_output(download_id, child, stdout, stderr, sender));

        let stream = ReceiverStream::new(receiver).map(Ok::<_, Infallible>);
        Ok(Body::from_stream(stream))
    }

    fn spawn_error(&self, error: io::Error) -> ApiError {
        let details = if error.kind() == ErrorKind::NotFound {
            format!(
                "`{}` was not found. Install yt-dlp or set YT_DLP_CMD.",
                self.program
            )
        } else {
            format!("Could not run `{}`: {error}", self.program)
        };
        warn!("{details}");
        ApiError::spawn_failure(details)
    }
}

async fn relay_output(
    download_id: Uuid,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    sender: mpsc::Sender<Bytes>,
) {
    let output = ReaderStream::new(stdout).merge(ReaderStream::new(stderr));
    tokio::pin!(output);

    // The process is never cancelled; after a disconnect its output is still
    // drained so it cannot stall on a full pipe.
    let mut client_connected = true;
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => {
                if client_connected && sender.send(bytes).await.is_err() {
                    client_connected = false;
                    info!(%download_id, "Client disconnected, downloader keeps running");
                }
            }
            Err(error) => warn!(%download_id, "Failed to read downloader output: {error}"),
        }
    }

    let code = match child.wait().await {
        Ok(status) => exit_code_label(status),
        Err(error) => {
            warn!(%download_id, "Failed to wait for downloader: {error}");
            "null".to_string()
        }
    };
    info!(%download_id, code = %code, "Downloader exited");

    if client_connected {
        let _ = sender
            .send(Bytes::from(format!("\nProcess exited with code {code}")))
            .await;
    }
}

/// Exit code as text; `null` when the process was terminated by a signal.
fn exit_code_label(status: ExitStatus) -> String {
    status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_info(json: serde_json::Value) -> YtDlpVideoInfo {
        serde_json::from_value(json).expect("valid video info")
    }

    #[test]
    fn projects_width_and_height_into_resolution() {
        let response = video_info(serde_json::json!({
            "title": "T",
            "formats": [{
                "format_id": "137",
                "ext": "mp4",
                "width": 1280,
                "height": 720,
                "filesize": 10485760
            }]
        }))
        .into_formats_response();

        assert_eq!(response.title, Some(Value::from("T")));
        assert_eq!(
            response.formats,
            vec![FormatSummary {
                format_id: Some("137".into()),
                ext: Some("mp4".into()),
                resolution: "1280x720".to_string(),
                note: String::new(),
                filesize: "10.00 MB".to_string(),
                vcodec: None,
                acodec: None,
            }]
        );
    }

    #[test]
    fn serialized_summary_omits_absent_codecs() {
        let response = video_info(serde_json::json!({
            "title": "T",
            "duration": 75,
            "formats": [{"format_id": "137", "ext": "mp4", "width": 1280, "height": 720, "filesize": 10485760}]
        }))
        .into_formats_response();

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({
                "title": "T",
                "formats": [{
                    "format_id": "137",
                    "ext": "mp4",
                    "resolution": "1280x720",
                    "note": "",
                    "filesize": "10.00 MB"
                }],
                "duration": 75,
                "duration_string": "01:15"
            })
        );
    }

    #[test]
    fn explicit_nulls_are_passed_through() {
        let response = video_info(serde_json::json!({
            "title": null,
            "formats": [{"format_id": "18", "ext": null, "resolution": "640x360", "vcodec": null, "acodec": "mp4a"}]
        }))
        .into_formats_response();

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["title"], Value::Null);
        assert!(json.as_object().unwrap().contains_key("title"));
        assert_eq!(
            json["formats"][0],
            serde_json::json!({
                "format_id": "18",
                "ext": null,
                "resolution": "640x360",
                "note": "",
                "filesize": "N/A",
                "vcodec": null,
                "acodec": "mp4a"
            })
        );
    }

    #[test]
    fn missing_or_zero_duration_falls_back_to_an_hour() {
        for info in [
            serde_json::json!({}),
            serde_json::json!({"duration": 0}),
            serde_json::json!({"duration": null, "duration_string": ""}),
        ] {
            let response = video_info(info).into_formats_response();
            assert_eq!(response.duration, Number::from(3600));
            assert_eq!(response.duration_string, "1:00:00");
        }
    }

    #[test]
    fn duration_string_is_kept_or_derived() {
        let given = video_info(serde_json::json!({"duration": 212, "duration_string": "3:32"}))
            .into_formats_response();
        assert_eq!(given.duration, Number::from(212));
        assert_eq!(given.duration_string, "3:32");

        let fractional = video_info(serde_json::json!({"duration": 3725.6})).into_formats_response();
        assert_eq!(fractional.duration.as_f64(), Some(3725.6));
        assert_eq!(fractional.duration_string, "1:02:05");
    }

    #[test]
    fn duration_format_switches_to_hours() {
        assert_eq!(format_duration(0.0), "00:00");
        assert_eq!(format_duration(75.0), "01:15");
        assert_eq!(format_duration(3599.9), "59:59");
        assert_eq!(format_duration(36_000.0), "10:00:00");
    }

    #[test]
    fn explicit_resolution_wins_over_dimensions() {
        let response = video_info(serde_json::json!({
            "formats": [{"format_id": "22", "resolution": "720p", "width": 1, "height": 1}]
        }))
        .into_formats_response();

        assert_eq!(response.formats[0].resolution, "720p");
        assert!(response.title.is_none());
        assert!(!serde_json::to_value(&response).unwrap().as_object().unwrap().contains_key("title"));
    }

    #[test]
    fn drops_audio_only_entries() {
        let response = video_info(serde_json::json!({
            "title": "Mixed",
            "formats": [
                {"format_id": "140", "resolution": "audio only", "acodec": "mp4a.40.2", "vcodec": "none"},
                {"format_id": "251", "acodec": "opus"},
                {"format_id": "sb0", "width": 0, "height": 90},
                {"format_id": "18", "width": 640, "height": 360, "format_note": "360p", "vcodec": "avc1", "acodec": "mp4a"},
                {"format_id": "22", "resolution": "1280x720"}
            ]
        }))
        .into_formats_response();

        let ids: Vec<_> = response
            .formats
            .iter()
            .filter_map(|format| format.format_id.as_ref().and_then(Value::as_str))
            .collect();
        assert_eq!(ids, vec!["18", "22"]);
        assert_eq!(response.formats[0].note, "360p");
        assert_eq!(response.formats[0].vcodec, Some(Value::from("avc1")));
    }

    #[test]
    fn missing_or_null_formats_list_is_empty() {
        let absent = video_info(serde_json::json!({"title": "No formats"})).into_formats_response();
        let null = video_info(serde_json::json!({"title": "Null", "formats": null})).into_formats_response();

        assert!(absent.formats.is_empty());
        assert!(null.formats.is_empty());
    }

    #[test]
    fn filesize_is_reported_in_megabytes() {
        assert_eq!(format_filesize_mb(10_485_760.0), "10.00 MB");
        assert_eq!(format_filesize_mb(1_572_864.0), "1.50 MB");
        assert_eq!(format_filesize_mb(131_072.0), "0.13 MB");
        assert_eq!(format_filesize_mb(1.0), "0.00 MB");
    }

    #[test]
    fn zero_or_absent_filesize_is_unknown() {
        let response = video_info(serde_json::json!({
            "formats": [
                {"format_id": "a", "resolution": "1x1", "filesize": 0},
                {"format_id": "b", "resolution": "1x1"},
                {"format_id": "c", "resolution": "1x1", "filesize": null}
            ]
        }))
        .into_formats_response();

        assert!(response.formats.iter().all(|format| format.filesize == "N/A"));
    }

    #[test]
    fn section_args_default_to_best_format() {
        let request = DownloadRequest {
            url: "https://example.com/watch?v=1".to_string(),
            format_id: None,
            start_time: "34:31".to_string(),
            end_time: "36:00".to_string(),
        };

        assert_eq!(
            section_download_args(&request),
            vec![
                "-f",
                "best",
                "https://example.com/watch?v=1",
                "-o",
                "%(title)s_%(section_start)s-%(section_end)s_%(epoch)s.%(ext)s",
                "--download-sections",
                "*34:31-36:00",
                "--force-keyframes-at-cuts",
            ]
        );
    }

    #[test]
    fn section_args_use_selected_format() {
        let request = DownloadRequest {
            url: "u".to_string(),
            format_id: Some("137+140".to_string()),
            start_time: "0".to_string(),
            end_time: "10".to_string(),
        };

        let args = section_download_args(&request);
        assert_eq!(&args[..3], ["-f", "137+140", "u"]);
        assert_eq!(args[6], "*0-10");
    }

    #[test]
    fn command_line_splits_program_and_leading_args() {
        let downloader =
            Downloader::from_command_line("  python3 -m yt_dlp ", PathBuf::from("/tmp")).unwrap();

        assert_eq!(
            downloader.describe(&["-J".to_string(), "u".to_string()]),
            "python3 -m yt_dlp -J u"
        );
        assert_eq!(downloader.work_dir(), Path::new("/tmp"));
        assert!(Downloader::from_command_line("   ", PathBuf::from("/tmp")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_label_reports_signals_as_null() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_code_label(ExitStatus::from_raw(3 << 8)), "3");
        assert_eq!(exit_code_label(ExitStatus::from_raw(0)), "0");
        assert_eq!(exit_code_label(ExitStatus::from_raw(9)), "null");
    }
}
