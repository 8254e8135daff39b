use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::Sink;
use crate::config::{EventsConfig, OutputConfig};
use crate::flow::Eviction;
use crate::protocol::{Category, CATEGORY_COUNT};

/// Appends one JSON object per line to `<directory>/<stem>.json`, one file
/// per category. Files are opened on first write.
pub struct JsonFileSink {
    timestamp_format: String,
    files: [CategoryFile; CATEGORY_COUNT],
}

struct CategoryFile {
    path: PathBuf,
    writer: Mutex<Option<LineWriter<File>>>,
}

impl JsonFileSink {
    pub fn new(output: &OutputConfig, events: &EventsConfig) -> Result<Self> {
        if StrftimeItems::new(&output.timestamp_format).any(|item| matches!(item, Item::Error)) {
            bail!(
                "invalid output.timestamp_format {:?}",
                output.timestamp_format
            );
        }

        std::fs::create_dir_all(&output.directory).with_context(|| {
            format!("creating output directory {}", output.directory.display())
        })?;

        let files = std::array::from_fn(|i| {
            let category = Category::all()
                .get(i)
                .copied()
                .unwrap_or(Category::Error);
            let stem = events.get(category).file_stem(category);
            CategoryFile {
                path: output.directory.join(format!("{stem}.json")),
                writer: Mutex::new(None),
            }
        });

        Ok(Self {
            timestamp_format: output.timestamp_format.clone(),
            files,
        })
    }

    /// Output path used for `category`.
    pub fn path(&self, category: Category) -> Option<&Path> {
        self.files.get(category.index()).map(|f| f.path.as_path())
    }

    fn timestamp(&self) -> Result<String> {
        let mut out = String::new();
        write!(out, "{}", chrono::Local::now().format(&self.timestamp_format))
            .context("formatting timestamp")?;
        Ok(out)
    }
}

impl Sink for JsonFileSink {
    fn name(&self) -> &str {
        "json_file"
    }

    fn handle(
        &self,
        category: Category,
        mut event: Map<String, Value>,
        eviction: Option<&Eviction>,
    ) -> Result<()> {
        event.insert("timestamp".to_string(), Value::String(self.timestamp()?));
        if let Some(eviction) = eviction {
            event.insert("flow_cleanup".to_string(), eviction.to_json());
        }

        let mut line = serde_json::to_vec(&event).context("serializing event")?;
        line.push(b'\n');

        let Some(file) = self.files.get(category.index()) else {
            bail!("no output file for category {category}");
        };

        let mut guard = file.writer.lock();
        if guard.is_none() {
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file.path)
                .with_context(|| format!("opening {}", file.path.display()))?;
            tracing::info!(category = %category, path = %file.path.display(), "opened event log");
            *guard = Some(LineWriter::new(handle));
        }

        if let Some(writer) = guard.as_mut() {
            writer
                .write_all(&line)
                .with_context(|| format!("writing {}", file.path.display()))?;
        }

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        for file in &self.files {
            if let Some(writer) = file.writer.lock().as_mut() {
                writer
                    .flush()
                    .with_context(|| format!("flushing {}", file.path.display()))?;
            }
        }
        Ok(())
    }
}
