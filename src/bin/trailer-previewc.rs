use std::{env, path::PathBuf, process, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use trailer_preview::{
    api::VERSION,
    config::{normalize_base_path, ConfigSnapshot},
    descriptor::TrailerDescriptor,
    engine::{self, dom::SharedDocument, overlay::OVERLAY_CLASS, platform::ClientEnvironment},
    injection::{patch_file, script_tag},
    lookup::HttpTrailerLookup,
};

const DEFAULT_URL: &str = "http://127.0.0.1:8097";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    enabled: bool,
    hover_delay_ms: u64,
    version: String,
}

fn server_url() -> String {
    env::var("TRAILER_PREVIEW_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn usage() {
    eprintln!(
        "{}",
        r#"Usage:
  trailer-previewc status
  trailer-previewc info <item-id>
  trailer-previewc patch <index.html> [--base-path <path>]
  trailer-previewc preview <item-id> [--title <text>] [--hold-ms <n>]

The daemon is reached at $TRAILER_PREVIEW_URL (default http://127.0.0.1:8097).
preview runs the hover engine against the daemon and prints the overlay it mounts;
$TRAILER_PREVIEW_TOKEN fills the {API_KEY} slot of local trailer urls.
"#
    );
}

/// Pulls `--name value` out of `args`.
fn take_flag(args: &mut Vec<String>, name: &str) -> Option<String> {
    let i = args.iter().position(|a| a == name)?;
    if i + 1 >= args.len() {
        return None;
    }
    let value = args.remove(i + 1);
    args.remove(i);
    Some(value)
}

fn usage_exit() -> ! {
    usage();
    process::exit(2);
}

struct PatchArgs {
    index: PathBuf,
    base_path: String,
}

fn parse_patch(mut args: Vec<String>) -> Option<PatchArgs> {
    let base_path = take_flag(&mut args, "--base-path").unwrap_or_default();
    let index = PathBuf::from(args.first()?);
    Some(PatchArgs { index, base_path })
}

struct PreviewArgs {
    item_id: String,
    title: String,
    hold_ms: u64,
}

fn parse_preview(mut args: Vec<String>) -> Option<PreviewArgs> {
    let title = take_flag(&mut args, "--title").unwrap_or_else(|| "Unknown".to_string());
    let hold_ms = match take_flag(&mut args, "--hold-ms") {
        Some(v) => v.parse::<u64>().ok()?,
        None => 1_000,
    };
    let item_id = args.first()?.clone();
    Some(PreviewArgs {
        item_id,
        title,
        hold_ms,
    })
}

#[tokio::main]
async fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        usage_exit();
    }

    let cmd = args.remove(0);
    let result = match cmd.as_str() {
        "status" => run_status().await,
        "info" if !args.is_empty() => run_info(&args[0]).await,
        "patch" => match parse_patch(args) {
            Some(a) => run_patch(&a),
            None => usage_exit(),
        },
        "preview" => match parse_preview(args) {
            Some(a) => run_preview(a).await,
            None => usage_exit(),
        },
        _ => usage_exit(),
    };
    if let Err(e) = result {
        eprintln!("trailer-previewc: {e:#}");
        process::exit(1);
    }
}

fn http() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building http client")
}

async fn run_status() -> Result<()> {
    let url = format!("{}/TrailerPreview/Status", server_url());
    let status: Status = http()?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("decoding status")?;
    println!(
        "enabled={} hover_delay_ms={} version={}",
        status.enabled, status.hover_delay_ms, status.version
    );
    Ok(())
}

async fn run_info(item_id: &str) -> Result<()> {
    let url = format!("{}/TrailerPreview/TrailerInfo/{item_id}", server_url());
    let resp = http()?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    // 404 still carries an unavailable descriptor
    if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
        bail!("{url}: {}", resp.status());
    }
    let descriptor: TrailerDescriptor = resp.json().await.context("decoding trailer info")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&descriptor).context("encoding trailer info")?
    );
    Ok(())
}

fn run_patch(args: &PatchArgs) -> Result<()> {
    let tag = script_tag(&normalize_base_path(&args.base_path), VERSION);
    let report = patch_file(&args.index, &tag)?;
    println!("{report}");
    if !report.script_reachable() {
        process::exit(1);
    }
    Ok(())
}

async fn run_preview(args: PreviewArgs) -> Result<()> {
    let PreviewArgs {
        item_id,
        title,
        hold_ms,
    } = args;
    let base = server_url();

    let url = format!("{base}/TrailerPreview/Configuration");
    let config: ConfigSnapshot = http()?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("decoding configuration")?;
    let wait = Duration::from_millis(config.timing.hover_delay_ms + hold_ms);

    let mut env = ClientEnvironment::with_user_agent(format!("trailer-previewc/{VERSION}"));
    env.access_token = env::var("TRAILER_PREVIEW_TOKEN").ok();

    let doc = SharedDocument::default();
    let lookup = HttpTrailerLookup::new(&base, Duration::from_secs(10))?;
    let handle = engine::initialize(config, env, doc.clone(), lookup);
    if !handle.is_active() {
        bail!("previews are disabled for this client");
    }

    handle.hover_enter(item_id.as_str(), title.as_str());
    tokio::time::sleep(wait).await;

    let state = handle.state().await.context("engine stopped")?;
    if state.open.is_empty() {
        println!("{item_id}: no preview");
        return Ok(());
    }
    let lines = doc.read(|d| {
        d.query(|d, n| d.has_class(n, OVERLAY_CLASS))
            .into_iter()
            .flat_map(|scrim| d.descendants(scrim))
            .filter_map(|n| match d.tag(n) {
                Some(tag @ ("video" | "iframe")) => {
                    Some(format!("{tag} {}", d.attr(n, "src").unwrap_or("")))
                }
                _ => None,
            })
            .collect::<Vec<_>>()
    });
    println!("{item_id}: open");
    for line in lines {
        println!("  {line}");
    }
    handle.request_close();
    Ok(())
}
