use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use image_locator::config::{self, LocatorConfig, LookBehind};
use image_locator::{resolve_element_image, Document, Locator, Query, RenderTreeAccessor};
use rand::Rng;
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "image-locator",
    version,
    about = "Resolve the background-image or img source under a point of a rendered document snapshot"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Resolve the image URL at a click position
    Locate(LocateArgs),
    /// Dump the hit-test stack at a position as JSON
    #[command(name = "hit-test")]
    HitTest(HitTestArgs),
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Document snapshot (.json tree, or .tsv/.rows depth rows)
    snapshot: PathBuf,
    /// Click x coordinate in document pixels
    #[arg(long, allow_negative_numbers = true)]
    x: f64,
    /// Click y coordinate in document pixels
    #[arg(long, allow_negative_numbers = true)]
    y: f64,
    /// Locator config JSON (default: IMAGE_LOCATOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
    /// occlusion-probe|bounds-check
    #[arg(long)]
    look_behind: Option<LookBehind>,
    /// Neighborhood scan radius in pixels
    #[arg(long)]
    radius: Option<f64>,
    /// Skip ancestor traversal
    #[arg(long, action = ArgAction::SetTrue)]
    no_ancestors: bool,
    /// Skip descendant scan
    #[arg(long, action = ArgAction::SetTrue)]
    no_descendants: bool,
    /// Skip neighborhood scan
    #[arg(long, action = ArgAction::SetTrue)]
    no_neighborhood: bool,
    /// Print the full result payload JSON instead of the bare URL
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Save the result payload under IMAGE_LOCATOR_OUT_DIR/locate
    #[arg(long, action = ArgAction::SetTrue)]
    save: bool,
    /// Explicit path for the saved result payload (implies --save)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Exit non-zero when no image is found
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
}

#[derive(Args, Debug)]
struct HitTestArgs {
    /// Document snapshot (.json tree, or .tsv/.rows depth rows)
    snapshot: PathBuf,
    #[arg(long, allow_negative_numbers = true)]
    x: f64,
    #[arg(long, allow_negative_numbers = true)]
    y: f64,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Locate(args) => command_locate(args),
        Commands::HitTest(args) => command_hit_test(args),
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "locate",
            "description": "Resolve the image URL under a click position in a document snapshot.",
            "runner": "rust"
        }),
        json!({
            "name": "hit-test",
            "description": "Dump the hit-test stack (tag/class/rect/style) at a position.",
            "runner": "rust"
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_locate(args: LocateArgs) -> Result<()> {
    let query = parse_query(args.x, args.y)?;
    let document = load_document(&args.snapshot)?;
    let config = locator_config(&args)?;
    let locator = Locator::new(config);

    let result = locator.locate(&document, query);
    info!(
        success = result.success,
        strategy = %result.diagnostics.strategy,
        elements_found = result.diagnostics.elements_found,
        "locate finished"
    );

    let payload = json!({
        "located_at": timestamp_iso(),
        "snapshot": abs_path(&args.snapshot).display().to_string(),
        "element_count": document.len(),
        "query": { "x": query.x, "y": query.y },
        "config": locator.config(),
        "result": &result,
    });

    if args.save || args.out.is_some() {
        let out = args
            .out
            .clone()
            .unwrap_or_else(|| default_result_path(&config::out_root(), &args.snapshot));
        write_json_pretty(&out, &payload)?;
        eprintln!("{}", abs_path(&out).display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if let Some(url) = result.url() {
        println!("{url}");
    } else if let Some(reason) = result.reason.as_deref() {
        eprintln!("{reason}");
    }

    if args.strict && !result.success {
        bail!(
            "{}",
            result
                .reason
                .as_deref()
                .unwrap_or("no image found at coordinates")
        );
    }
    Ok(())
}

fn command_hit_test(args: HitTestArgs) -> Result<()> {
    let query = parse_query(args.x, args.y)?;
    let document = load_document(&args.snapshot)?;
    let stack = hit_stack_value(&document, query)?;

    let payload = json!({
        "captured_at": timestamp_iso(),
        "snapshot": abs_path(&args.snapshot).display().to_string(),
        "query": { "x": query.x, "y": query.y },
        "element_count": stack.len(),
        "elements": stack,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn parse_query(x: f64, y: f64) -> Result<Query> {
    if !x.is_finite() || !y.is_finite() {
        bail!("coordinates must be finite numbers (got x={x}, y={y})");
    }
    Ok(Query::new(x, y))
}

fn load_document(path: &Path) -> Result<Document> {
    let document = Document::load(path)
        .with_context(|| format!("failed to load snapshot: {}", path.display()))?;
    debug!(elements = document.len(), path = %path.display(), "snapshot loaded");
    Ok(document)
}

fn locator_config(args: &LocateArgs) -> Result<LocatorConfig> {
    let mut config = LocatorConfig::resolve(args.config.as_deref())
        .context("failed to resolve locator config")?;
    if let Some(look_behind) = args.look_behind {
        config.look_behind = look_behind;
    }
    if let Some(radius) = args.radius {
        config.neighborhood_radius = radius;
    }
    if args.no_ancestors {
        config.ancestor_traversal = false;
    }
    if args.no_descendants {
        config.descendant_scan = false;
    }
    if args.no_neighborhood {
        config.neighborhood_scan = false;
    }
    config.validate()?;
    Ok(config)
}

fn hit_stack_value(document: &Document, query: Query) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    for (layer, id) in document.elements_at(query)?.into_iter().enumerate() {
        let info = document.describe(id)?;
        let rect = document.bounding_rect(id)?;
        let style = match document.computed_style(id) {
            Ok(style) => json!({
                "background_image": style.background_image,
                "z_index": style.z_index,
            }),
            Err(err) => json!({ "error": err.to_string() }),
        };
        rows.push(json!({
            "layer": layer,
            "id": id,
            "depth": document.depth(id),
            "tag": info.tag,
            "class": info.class,
            "src": info.src,
            "rect": rect,
            "style": style,
            "image": resolve_element_image(document, id),
        }));
    }
    Ok(rows)
}

fn default_result_path(out_root: &Path, snapshot: &Path) -> PathBuf {
    let stem = snapshot
        .file_stem()
        .and_then(|s| s.to_str())
        .map(slugify)
        .unwrap_or_else(|| "snapshot".to_string());
    out_root.join("locate").join(format!(
        "locate-{stem}-{}-{}-{}.json",
        timestamp_compact(),
        std::process::id(),
        rand::thread_rng().gen_range(1000..9999)
    ))
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || matches!(lower, '.' | '_' | '-') {
            out.push(lower);
        } else if lower.is_ascii_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "snapshot".to_string()
    } else {
        out
    }
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_ROWS: &str = "0\thtml\t\t0\t0\t800\t600\n\
                             1\tbody\t\t0\t0\t800\t600\n\
                             2\tdiv\thero\t0\t0\t400\t300\t\turl('https://x/img.png')\n\
                             2\tdiv\ttint\t0\t0\t400\t300\t5\n";

    #[test]
    fn writes_json_pretty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b.json");
        write_json_pretty(&target, &json!({"ok": true})).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn parses_locate_flags() {
        let cli = Cli::try_parse_from([
            "image-locator",
            "-vv",
            "locate",
            "page.json",
            "--x",
            "-4",
            "--y",
            "12.5",
            "--look-behind",
            "occlusion-probe",
            "--radius",
            "3",
            "--no-descendants",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Locate(args) = cli.command else {
            panic!("expected locate");
        };
        assert_eq!(args.x, -4.0);
        assert_eq!(args.y, 12.5);
        assert_eq!(args.look_behind, Some(LookBehind::OcclusionProbe));
        assert!(args.no_descendants);
        assert!(args.json);
    }

    #[test]
    fn rejects_unknown_look_behind() {
        let err = Cli::try_parse_from([
            "image-locator",
            "locate",
            "page.json",
            "--x",
            "1",
            "--y",
            "1",
            "--look-behind",
            "sideways",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn parse_query_rejects_non_finite() {
        assert!(parse_query(f64::NAN, 1.0).is_err());
        assert!(parse_query(1.0, f64::INFINITY).is_err());
        assert_eq!(parse_query(-3.0, 2.0).unwrap(), Query::new(-3.0, 2.0));
    }

    #[test]
    fn hit_stack_lists_layers_topmost_first() {
        let doc = Document::from_rows(PAGE_ROWS).unwrap();
        let rows = hit_stack_value(&doc, Query::new(10.0, 10.0)).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["class"], json!("tint"));
        assert_eq!(rows[0]["style"]["z_index"], json!("5"));
        assert_eq!(rows[0]["image"], Value::Null);
        assert_eq!(rows[1]["image"], json!("https://x/img.png"));
        assert_eq!(rows[3]["tag"], json!("html"));
        assert_eq!(rows[3]["depth"], json!(0));
    }

    #[test]
    fn locate_saves_payload_to_explicit_path() {
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join("page.tsv");
        fs::write(&snapshot, PAGE_ROWS).unwrap();
        let out = dir.path().join("results").join("hit.json");

        command_locate(LocateArgs {
            snapshot: snapshot.clone(),
            x: 50.0,
            y: 50.0,
            config: None,
            look_behind: Some(LookBehind::BoundsCheck),
            radius: None,
            no_ancestors: false,
            no_descendants: false,
            no_neighborhood: false,
            json: false,
            save: false,
            out: Some(out.clone()),
            strict: true,
        })
        .unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(saved["result"]["success"], json!(true));
        assert_eq!(saved["result"]["url"], json!("https://x/img.png"));
        assert_eq!(saved["result"]["diagnostics"]["strategy"], json!("direct-check"));
        assert_eq!(saved["config"]["look_behind"], json!("bounds-check"));
        assert_eq!(saved["element_count"], json!(4));
    }

    #[test]
    fn strict_locate_fails_outside_document() {
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join("page.tsv");
        fs::write(&snapshot, PAGE_ROWS).unwrap();

        let err = command_locate(LocateArgs {
            snapshot,
            x: 5000.0,
            y: 5000.0,
            config: None,
            look_behind: Some(LookBehind::BoundsCheck),
            radius: None,
            no_ancestors: false,
            no_descendants: false,
            no_neighborhood: false,
            json: false,
            save: false,
            out: None,
            strict: true,
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "no elements found at coordinates");
    }

    #[test]
    fn demo_snapshot_resolves_hero_and_gallery() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("demos")
            .join("overlay-page.json");
        let doc = load_document(&path).unwrap();
        let locator = Locator::default();

        let hero = locator.locate(&doc, Query::new(200.0, 100.0));
        assert_eq!(hero.url(), Some("https://cdn.example.com/hero.jpg"));
        assert_eq!(hero.diagnostics.checked[0].class, "hero__tint");

        let gallery = locator.locate(&doc, Query::new(100.0, 600.0));
        assert_eq!(gallery.url(), Some("https://cdn.example.com/a.jpg"));
    }

    #[test]
    fn default_result_path_is_slugged_under_locate() {
        let path = default_result_path(Path::new("/tmp/out"), Path::new("My Page.json"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(path.starts_with("/tmp/out/locate"));
        assert!(name.starts_with("locate-my-page-"), "{name}");
        assert!(name.ends_with(".json"));
    }
}
