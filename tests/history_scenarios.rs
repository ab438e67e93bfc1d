use chrono::{DateTime, Days, Duration as ChronoDuration, Local, TimeZone, Utc};
use klip_lib::commands;
use klip_lib::settings::RETENTION_DAYS;
use klip_lib::{
    CaptureError, ClipKind, ClipboardContent, ClipboardSource, Config, HistoryCore, NewClip, NewImage,
    OcrEngine, OcrError,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::runtime::Handle;

#[derive(Clone, Default)]
struct SharedClipboard(Arc<Mutex<ClipboardContent>>);

impl SharedClipboard {
    fn put_text(&self, text: &str) {
        *self.0.lock().unwrap() = ClipboardContent::Text(text.to_string());
    }
}

impl ClipboardSource for SharedClipboard {
    fn read(&mut self, _want_image: bool) -> Result<ClipboardContent, CaptureError> {
        Ok(self.0.lock().unwrap().clone())
    }

    fn write_text(&mut self, text: &str) -> Result<(), CaptureError> {
        self.put_text(text);
        Ok(())
    }

    fn write_image(&mut self, width: usize, height: usize, rgba: Vec<u8>) -> Result<(), CaptureError> {
        *self.0.lock().unwrap() = ClipboardContent::Image { width, height, rgba };
        Ok(())
    }
}

struct InvoiceReader;

impl OcrEngine for InvoiceReader {
    fn recognize(&self, image: &Path, _languages: &[String]) -> Result<String, OcrError> {
        assert!(image.exists());
        Ok("INVOICE 123\n".to_string())
    }
}

fn open(handle: Handle) -> (TempDir, SharedClipboard, HistoryCore) {
    let dir = tempfile::tempdir().unwrap();
    let clipboard = SharedClipboard::default();
    let core = HistoryCore::open(
        Config::with_data_dir(dir.path().join("data")),
        Box::new(clipboard.clone()),
        Arc::new(InvoiceReader),
        handle,
    )
    .unwrap();
    (dir, clipboard, core)
}

/// Local noon `days` before today, clear of midnight and DST switches.
fn local_noon(days: u64) -> DateTime<Local> {
    let date = Local::now().date_naive() - Days::new(days);
    Local
        .from_local_datetime(&date.and_hms_opt(12, 0, 0).unwrap())
        .earliest()
        .unwrap()
}

fn contents(core: &HistoryCore) -> Vec<String> {
    commands::get_clips(core, None, None)
        .unwrap()
        .into_iter()
        .map(|c| c.content)
        .collect()
}

#[tokio::test]
async fn scenario_a_equal_captures_collapse() {
    let (_dir, clipboard, core) = open(Handle::current());

    clipboard.put_text("hello");
    core.watcher().poll_once().unwrap();
    clipboard.put_text("hello");
    core.watcher().poll_once().unwrap();
    assert_eq!(contents(&core), vec!["hello"]);

    clipboard.put_text("world");
    core.watcher().poll_once().unwrap();
    assert_eq!(contents(&core), vec!["world", "hello"]);
}

#[tokio::test]
async fn scenario_b_ocr_backfills_image_clip() {
    let (dir, _clipboard, core) = open(Handle::current());
    let external = dir.path().join("data").join("a.png");
    std::fs::write(&external, b"not really a png").unwrap();

    let clip = core.store().insert_image(NewImage::adopt(&external)).unwrap();
    assert_eq!(clip.content, "");

    let job = commands::submit_ocr(&core, &clip.id, &external).unwrap();
    assert_eq!(job.wait().await.unwrap(), "INVOICE 123");

    let clips = commands::get_clips(&core, None, None).unwrap();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].id, clip.id);
    assert_eq!(clips[0].content, "INVOICE 123");
    assert_eq!(
        clips[0].kind,
        ClipKind::Image {
            image_path: external.clone()
        }
    );

    let hits = commands::get_clips(&core, Some("invoice"), None).unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn scenario_c_retention_respects_favorites() {
    let (_dir, _clipboard, core) = open(Handle::current());
    commands::set_setting(&core, RETENTION_DAYS, "30").unwrap();

    let stale = core
        .store()
        .insert_image(NewImage::png(b"old".to_vec()).at(Utc::now() - ChronoDuration::days(40)))
        .unwrap();
    let stale_file = stale.image_path().unwrap().to_path_buf();
    let pinned = core
        .store()
        .insert(
            NewClip::text("keep forever")
                .at(Utc::now() - ChronoDuration::days(100))
                .favorite(true),
        )
        .unwrap();
    assert!(stale_file.exists());
    assert_eq!(commands::get_clips(&core, None, None).unwrap().len(), 2);

    let report = commands::run_retention_sweep(&core).unwrap();
    assert_eq!(report.expired, 1);

    let ids: Vec<_> = commands::get_clips(&core, None, None)
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![pinned.id]);
    assert!(!stale_file.exists());
}

#[tokio::test]
async fn deleted_clip_never_comes_back() {
    let (_dir, clipboard, core) = open(Handle::current());
    clipboard.put_text("secret");
    let clip = core.watcher().poll_once().unwrap().unwrap();

    commands::delete_clip(&core, &clip.id).unwrap();
    assert!(commands::get_clips(&core, None, None)
        .unwrap()
        .iter()
        .all(|c| c.id != clip.id));
    assert!(commands::get_clips(&core, Some("secret"), None).unwrap().is_empty());
    assert!(commands::delete_clip(&core, &clip.id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn update_keeps_clip_type() {
    let (_dir, _clipboard, core) = open(Handle::current());
    let text = core.store().insert(NewClip::text("draft")).unwrap();
    let image = core.store().insert_image(NewImage::png(b"img".to_vec())).unwrap();

    commands::update_clip_content(&core, &text.id, "X").unwrap();
    commands::update_clip_content(&core, &image.id, "X").unwrap();

    for clip in commands::get_clips(&core, None, None).unwrap() {
        assert_eq!(clip.content, "X");
        let original = if clip.id == text.id { &text } else { &image };
        assert_eq!(clip.kind, original.kind);
    }
    assert!(commands::update_clip_content(&core, "gone", "X")
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn date_facets_ignore_active_search() {
    let (_dir, _clipboard, core) = open(Handle::current());
    for (days, text) in [(0, "apple"), (2, "banana"), (2, "cherry"), (5, "apple pie")] {
        let at = local_noon(days).with_timezone(&Utc);
        core.store().insert(NewClip::text(text).at(at)).unwrap();
    }

    let expected: Vec<String> = [0, 2, 5]
        .iter()
        .map(|d| local_noon(*d).format("%Y-%m-%d").to_string())
        .collect();
    assert_eq!(commands::get_dates_with_clips(&core).unwrap(), expected);

    let banana_day = &expected[1];
    let on_day = commands::get_clips(&core, Some(""), Some(banana_day)).unwrap();
    assert_eq!(on_day.len(), 2);
    let filtered = commands::get_clips(&core, Some("CHERRY"), Some(banana_day)).unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(commands::get_dates_with_clips(&core).unwrap(), expected);
}
