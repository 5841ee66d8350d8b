use super::*;

use std::collections::HashMap;

use render::{render_progress_line, render_response_line, render_status_line, OutputStyle};
use shoppack_core::Operation;

#[test]
fn install_parses_manifest_and_poll_flags() {
    let cli = Cli::try_parse_from([
        "shoppack",
        "--root",
        "/srv/shop",
        "install",
        "classic.json",
        "--token",
        "abc",
        "--once",
        "--interval-ms",
        "250",
    ])
    .expect("must parse install");

    assert_eq!(cli.root, Some(PathBuf::from("/srv/shop")));
    match cli.command {
        Commands::Install {
            manifest,
            token,
            poll,
        } => {
            assert_eq!(manifest, PathBuf::from("classic.json"));
            assert_eq!(token.as_deref(), Some("abc"));
            assert!(poll.once);
            assert_eq!(poll.interval_ms, 250);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_flags_are_accepted_after_subcommand() {
    let cli = Cli::try_parse_from(["shoppack", "status", "classic", "--json", "-vv"])
        .expect("must parse status");
    assert!(cli.json);
    assert_eq!(cli.verbose, 2);
    assert!(matches!(cli.command, Commands::Status { ref txid } if txid == "classic"));
}

#[test]
fn remove_accepts_repeated_files_and_down_scripts() {
    let cli = Cli::try_parse_from([
        "shoppack",
        "remove",
        "blog",
        "--file",
        "modules/blog/blog.php",
        "--file",
        "modules/blog/views/list.tpl",
        "--down",
        "modules/blog/upgrade/down.sh",
    ])
    .expect("must parse remove");

    match cli.command {
        Commands::Remove {
            txid,
            dir,
            files,
            down,
            poll,
        } => {
            assert_eq!(txid, "blog");
            assert!(dir.is_none());
            assert_eq!(files.len(), 2);
            assert_eq!(down, vec!["modules/blog/upgrade/down.sh".to_string()]);
            assert!(!poll.once);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn remove_rejects_dir_together_with_files() {
    let err = Cli::try_parse_from([
        "shoppack",
        "remove",
        "classic",
        "--dir",
        "themes/classic",
        "--file",
        "themes/classic/theme.yml",
    ])
    .expect_err("dir and file must conflict");
    assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
}

#[test]
fn removal_request_needs_a_target() {
    let tmp = tempfile::tempdir().expect("must create temp dir");
    let fs = FsGateway::new(tmp.path());
    let err = build_removal_request(&fs, "classic", None, &[], Vec::new())
        .expect_err("empty removal must fail");
    assert!(err.to_string().contains("--dir"));
}

#[test]
fn removal_request_enumerates_directory() {
    let tmp = tempfile::tempdir().expect("must create temp dir");
    let theme = tmp.path().join("themes/classic/css");
    std::fs::create_dir_all(&theme).expect("must create theme dir");
    std::fs::write(theme.join("site.css"), "body {}").expect("must write css");
    std::fs::write(tmp.path().join("themes/classic/theme.yml"), "name: classic")
        .expect("must write theme.yml");

    let fs = FsGateway::new(tmp.path());
    let request = build_removal_request(&fs, "classic", Some("themes/classic"), &[], Vec::new())
        .expect("must build request");
    assert_eq!(
        request.files,
        vec![
            PathBuf::from("themes/classic/css/site.css"),
            PathBuf::from("themes/classic/theme.yml"),
        ]
    );
    assert_eq!(request.prune_stop, Some(PathBuf::from("themes")));
}

#[test]
fn resolve_config_layers_file_env_and_flags() {
    let tmp = tempfile::tempdir().expect("must create temp dir");
    std::fs::write(
        tmp.path().join("shoppack.toml"),
        "http_timeout_secs = 5\narchive_extraction = false\n",
    )
    .expect("must write config");

    let env: HashMap<&str, &str> = [("SHOPPACK_HTTP_TIMEOUT", "30"), ("SHOPPACK_ROOT", "/elsewhere")]
        .into_iter()
        .collect();
    let config = resolve_config(Some(tmp.path()), None, |key| {
        env.get(key).map(|value| value.to_string())
    })
    .expect("must resolve config");

    assert_eq!(config.root.as_deref(), Some(tmp.path()));
    assert_eq!(config.http_timeout_secs, 30);
    assert!(!config.archive_extraction);
}

#[test]
fn resolve_config_uses_env_root_without_flag() {
    let tmp = tempfile::tempdir().expect("must create temp dir");
    let root = tmp.path().display().to_string();
    let config = resolve_config(None, None, |key| {
        (key == "SHOPPACK_ROOT").then(|| root.clone())
    })
    .expect("must resolve config");
    assert_eq!(config.root.as_deref(), Some(tmp.path()));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "install of classic complete"),
        "install of classic complete"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "error", "install of classic failed"),
        "[ERR] install of classic failed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "step", "classic: install started (0%)"),
        "[..] classic: install started (0%)"
    );
}

#[test]
fn render_response_line_mentions_clear_cache() {
    let response = PollResponse {
        success: true,
        state: "migrated".to_string(),
        progress: 100,
        clear_cache: true,
    };
    assert_eq!(
        render_response_line("install", "core", &response),
        "install core: migrated (100%) clear-cache"
    );
}

#[test]
fn render_progress_line_is_plain_free() {
    assert!(render_progress_line(OutputStyle::Plain, "install", 50, "downloaded", None).is_none());
    let line = render_progress_line(OutputStyle::Rich, "install", 50, "downloaded", None)
        .expect("rich output renders a line");
    assert!(line.contains("==========----------"));
    assert!(line.contains(" 50% downloaded"));
}

#[test]
fn failure_messages_stay_generic() {
    let failed = InstallError::InstallationFailed {
        txid: "classic".to_string(),
        operation: Operation::Install,
        source: shoppack_installer::StageError::CorruptedProgressState {
            detail: "unknown checkpoint 33".to_string(),
        },
    };
    assert_eq!(failure_message("install", &failed), "install of classic failed");

    let busy = InstallError::Busy {
        txid: "classic".to_string(),
    };
    assert!(failure_message("install", &busy).contains("retry"));

    let conflict = InstallError::OperationConflict {
        txid: "classic".to_string(),
        active: Operation::Remove,
        requested: Operation::Install,
    };
    assert_eq!(
        failure_message("install", &conflict),
        "classic has an in-flight remove; finish or abandon it first"
    );
}

#[test]
fn drive_stops_after_one_poll_with_once() {
    let renderer = TerminalRenderer::new(OutputStyle::Plain, true);
    let mut polls = 0;
    drive(
        renderer,
        "install",
        "classic",
        PollArgs {
            once: true,
            interval_ms: 0,
        },
        || {
            polls += 1;
            Ok(PollResponse {
                success: true,
                state: "started".to_string(),
                progress: 0,
                clear_cache: false,
            })
        },
        || Ok(false),
    )
    .expect("single poll must succeed");
    assert_eq!(polls, 1);
}

#[test]
fn drive_abandons_after_panic() {
    let renderer = TerminalRenderer::new(OutputStyle::Plain, true);
    let mut abandoned = false;
    let result = drive(
        renderer,
        "install",
        "classic",
        PollArgs::default(),
        || -> Result<PollResponse, InstallError> { panic!("store handle poisoned") },
        || {
            abandoned = true;
            Ok(true)
        },
    );
    let _ = panic::take_hook();

    assert!(result.is_err());
    assert!(abandoned);
}

#[test]
fn paths_are_derived_from_root() {
    let config = InstallerConfig {
        root: Some(PathBuf::from("/srv/shop")),
        ..InstallerConfig::default()
    };
    let layout = config.layout().expect("layout");
    let lines = format_paths(&config, &layout);
    assert_eq!(lines[0], "root: /srv/shop");
    assert_eq!(lines[1], "store: /srv/shop/var/shoppack.sqlite");
    assert_eq!(
        lines.last().map(String::as_str),
        Some("marker: /srv/shop/var/cache/shoppack/update_needed")
    );
}
