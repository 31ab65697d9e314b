use crate::provider::ObjectStore;
use anyhow::{anyhow, Context, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub href: String,
    pub output: String,
    /// Size announced by the catalogue, checked against the remote object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl DownloadTask {
    pub fn new(href: &str, output: &str) -> Self {
        DownloadTask {
            href: href.to_string(),
            output: output.to_string(),
            size: None,
        }
    }

    pub fn with_size(self, size: Option<u64>) -> Self {
        Self { size, ..self }
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct DownloadPlan {
    tasks: Vec<DownloadTask>,
}

impl DownloadPlan {
    pub fn new(tasks: Vec<DownloadTask>) -> Self {
        Self { tasks }
    }

    pub fn tasks(self: &Self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Run all tasks, at most `concurrency` at a time. Every task is tried
    /// `max_retries + 1` times before the plan counts as failed.
    pub async fn execute(
        self: &Self,
        store: &impl ObjectStore,
        concurrency: usize,
        max_retries: u32,
    ) -> Result<()> {
        let failures = stream::iter(self.tasks.iter())
            .map(|task| async move {
                let result = download_with_retries(store, task, max_retries).await;
                if let Err(err) = &result {
                    error!("Download of {} failed: {:#}", task.output, err);
                }
                result
            })
            .buffer_unordered(concurrency.max(1))
            .filter(|result| futures_util::future::ready(result.is_err()))
            .count()
            .await;

        if failures > 0 {
            return Err(anyhow!(
                "{} of {} downloads failed",
                failures,
                self.tasks.len()
            ));
        }
        Ok(())
    }
}

async fn download_with_retries(
    store: &impl ObjectStore,
    task: &DownloadTask,
    max_retries: u32,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match try_download(store, task).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    "Retrying {} ({}/{}): {:#}",
                    task.output, attempt, max_retries, err
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn try_download(store: &impl ObjectStore, task: &DownloadTask) -> Result<()> {
    let (href, output) = (task.href.as_str(), task.output.as_str());
    // Check if the output file already exists; return early if so
    let dst = Path::new(output);
    if dst.exists() {
        info!("{} already exists", output);
        return Ok(());
    }

    // Make parent directories as necessary
    if let Some(parent_dir) = dst.parent() {
        fs::create_dir_all(parent_dir)?;
    }

    // Check if partial file exists and get its size
    let partial = format!("{}.partial", output);
    let mut partial_file = OpenOptions::new()
        .read(true)
        .create(true)
        .append(true)
        .open(&partial)
        .with_context(|| format!("Unable to open {partial}"))?;
    let mut byte_count = partial_file.metadata()?.len();

    let total_size = store.content_length(href).await?;
    if let Some(expected) = task.size {
        if expected != total_size {
            return Err(anyhow!(
                "Size mismatch for {}: catalogue lists {} bytes, remote object has {}",
                href,
                expected,
                total_size
            ));
        }
    }

    if byte_count > total_size {
        warn!("{} is larger than the remote object, restarting", partial);
        partial_file.set_len(0)?;
        byte_count = 0;
    }

    let progress = (byte_count as f64 / total_size.max(1) as f64) * 100.;
    if byte_count > 0 {
        info!("Resuming download of {} from {:.2}% completion", output, progress);
    }

    if byte_count < total_size {
        store
            .copy_range(href, byte_count, total_size - 1, &mut partial_file)
            .await?;
        byte_count = partial_file.metadata()?.len();
    }

    if byte_count != total_size {
        return Err(anyhow!(
            "Incomplete download of {}: {} of {} bytes",
            href,
            byte_count,
            total_size
        ));
    }

    // Rename the file to remove .partial suffix
    fs::rename(&partial, dst)?;
    info!("Downloaded {}", output);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockStore {
        objects: HashMap<String, Vec<u8>>,
        requests: AtomicUsize,
    }

    impl MockStore {
        fn new(objects: &[(&str, &[u8])]) -> Self {
            Self {
                objects: objects
                    .iter()
                    .map(|(href, data)| (href.to_string(), data.to_vec()))
                    .collect(),
                requests: AtomicUsize::new(0),
            }
        }

        fn object(&self, href: &str) -> Result<&Vec<u8>> {
            self.objects.get(href).ok_or(anyhow!("404 {}", href))
        }
    }

    impl ObjectStore for MockStore {
        async fn content_length(self: &Self, href: &str) -> Result<u64> {
            Ok(self.object(href)?.len() as u64)
        }

        async fn copy_range(
            self: &Self,
            href: &str,
            start: u64,
            end: u64,
            file: &mut File,
        ) -> Result<u64> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let bytes = &self.object(href)?[start as usize..=end as usize];
            file.write_all(bytes)?;
            Ok(bytes.len() as u64)
        }
    }

    fn mock_download_plan(dir: &Path) -> DownloadPlan {
        DownloadPlan::new(
            (1..=3)
                .map(|i| {
                    DownloadTask::new(
                        &format!("https://example.com/file{i}.tif"),
                        dir.join(format!("item/file{i}.tif")).to_str().unwrap(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_write_and_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download_plan.json");
        let plan = mock_download_plan(dir.path());
        plan.write(&path).unwrap();
        assert!(path.exists());

        let read = DownloadPlan::read(&path).unwrap();
        assert_eq!(read.tasks(), plan.tasks());
    }

    #[tokio::test]
    async fn test_execute_downloads_all_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let plan = mock_download_plan(dir.path());
        let store = MockStore::new(&[
            ("https://example.com/file1.tif", b"one"),
            ("https://example.com/file2.tif", b"two"),
            ("https://example.com/file3.tif", b"three"),
        ]);
        plan.execute(&store, 2, 0).await.unwrap();
        assert_eq!(fs::read(dir.path().join("item/file3.tif")).unwrap(), b"three");
        assert!(!dir.path().join("item/file3.tif.partial").exists());
    }

    #[tokio::test]
    async fn test_resume_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("B04.tif");
        fs::write(dir.path().join("B04.tif.partial"), b"0123").unwrap();
        let store = MockStore::new(&[("https://example.com/B04.tif", b"0123456789")]);

        let task = DownloadTask::new("https://example.com/B04.tif", output.to_str().unwrap());
        try_download(&store, &task).await.unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_existing_output_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("SCL.tif");
        fs::write(&output, b"done").unwrap();
        let store = MockStore::new(&[("https://example.com/SCL.tif", b"remote")]);

        let task = DownloadTask::new("https://example.com/SCL.tif", output.to_str().unwrap());
        try_download(&store, &task).await.unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"done");
        assert_eq!(store.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_complete_partial_needs_no_request() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("B08.tif");
        fs::write(dir.path().join("B08.tif.partial"), b"full").unwrap();
        let store = MockStore::new(&[("https://example.com/B08.tif", b"full")]);

        let task = DownloadTask::new("https://example.com/B08.tif", output.to_str().unwrap());
        try_download(&store, &task).await.unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"full");
        assert_eq!(store.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_task_fails_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = mock_download_plan(dir.path());
        let store = MockStore::new(&[("https://example.com/file1.tif", b"one")]);
        let err = plan.execute(&store, 3, 0).await.unwrap_err();
        assert_eq!(err.to_string(), "2 of 3 downloads failed");
        assert!(dir.path().join("item/file1.tif").exists());
    }

    #[tokio::test]
    async fn test_catalogue_size_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("B02.tif");
        let store = MockStore::new(&[("https://example.com/B02.tif", b"0123456789")]);

        let task = DownloadTask::new("https://example.com/B02.tif", output.to_str().unwrap())
            .with_size(Some(12));
        let err = try_download(&store, &task).await.unwrap_err();
        assert!(err.to_string().starts_with("Size mismatch"));
        assert!(!output.exists());
        assert_eq!(store.requests.load(Ordering::SeqCst), 0);

        let task = task.with_size(Some(10));
        try_download(&store, &task).await.unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"0123456789");
    }

    #[test]
    fn test_size_is_optional_in_json() {
        let task: DownloadTask =
            serde_json::from_str(r#"{"href": "https://example.com/a.tif", "output": "a.tif"}"#)
                .unwrap();
        assert_eq!(task.size, None);
        let json = serde_json::to_value(task.with_size(Some(3))).unwrap();
        assert_eq!(json["size"], 3);
    }
}
