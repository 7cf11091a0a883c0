//! 计数结果的 CSV 定时输出
//! Interval-scheduled CSV output of line counters
//!
//! 每到设定的间隔 (分钟) 就把每条计数线的两个方向计数各写一行,
//! 然后把计数器清零. 文件名带时间戳, 每次输出生成一个新文件

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Duration, Local, Timelike};
use tracing::info;

use crate::flow::lines::LineSpec;
use crate::gen_time_string;

pub struct CsvSchedule {
    output_dir: PathBuf,
    camera_name: String,
    with_minutes: bool,
    delta: Duration,
    last_update: DateTime<Local>,
}

impl CsvSchedule {
    pub fn new(output_dir: &str, camera_name: &str, minutes: u64, with_minutes: bool) -> Self {
        Self {
            output_dir: PathBuf::from(output_dir),
            camera_name: camera_name.to_string(),
            with_minutes,
            delta: Duration::minutes(minutes as i64),
            last_update: Local::now(),
        }
    }

    /// 每帧调用一次. 到点就输出并清零计数器, 返回是否有输出
    pub fn tick(&mut self, lines: &mut [LineSpec]) -> anyhow::Result<bool> {
        let now = Local::now();
        if now < self.last_update + self.delta {
            return Ok(false);
        }
        self.last_update = now;
        self.append(lines, now)?;
        Ok(true)
    }

    fn append(&self, lines: &mut [LineSpec], now: DateTime<Local>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!(
            "{}_{}.csv",
            gen_time_string("-"),
            self.camera_name
        ));
        let file = File::create(&path)?;
        let mut w = BufWriter::new(file);

        if self.with_minutes {
            writeln!(w, "Line,Id,Year,Month,Day,Hour,Minute,Count")?;
        } else {
            writeln!(w, "Line,Id,Year,Month,Day,Hour,Count")?;
        }

        for line in lines.iter_mut() {
            let (counter1, counter2) = line.counters();
            self.write_row(&mut w, line, &line.label1_text, line.label1_id, counter1, now)?;
            self.write_row(&mut w, line, &line.label2_text, line.label2_id, counter2, now)?;
            line.reset_counters();
        }
        w.flush()?;
        info!(camera = %self.camera_name, path = %path.display(), "analytics csv written");
        Ok(())
    }

    fn write_row(
        &self,
        w: &mut impl std::io::Write,
        line: &LineSpec,
        label: &str,
        label_id: u32,
        count: u64,
        now: DateTime<Local>,
    ) -> anyhow::Result<()> {
        if self.with_minutes {
            writeln!(
                w,
                "{}-{},{},{},{},{},{},{},{}",
                line.name,
                label,
                label_id,
                now.year(),
                now.month(),
                now.day(),
                now.hour(),
                now.minute(),
                count
            )?;
        } else {
            writeln!(
                w,
                "{}-{},{},{},{},{},{},{}",
                line.name,
                label,
                label_id,
                now.year(),
                now.month(),
                now.day(),
                now.hour(),
                count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LineConfig, SidePolarity};

    fn spec() -> LineSpec {
        let mut s = LineSpec::from_config(&LineConfig {
            name: "door".to_string(),
            end_points: [0, 100, 200, 100],
            side1: SidePolarity::Negative,
            count_splits: false,
            label1_text: "in".to_string(),
            label1_id: 1,
            label2_text: "out".to_string(),
            label2_id: 2,
        });
        s.bump_enter();
        s.bump_enter();
        s.bump_exit();
        s
    }

    // 间隔未到不输出
    #[test]
    fn tick_before_interval_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = CsvSchedule::new(dir.path().to_str().unwrap(), "cam0", 10, true);
        let mut lines = vec![spec()];
        assert!(!sched.tick(&mut lines).unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    // 到点输出: 两行 (每方向一行), 计数器清零
    #[test]
    fn flush_writes_two_rows_per_line_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = CsvSchedule::new(dir.path().to_str().unwrap(), "cam0", 0, true);
        // 间隔 0 分钟: 下一次 tick 立即输出
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut lines = vec![spec()];
        assert!(sched.tick(&mut lines).unwrap());
        assert_eq!(lines[0].counters(), (0, 0));

        let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(entry.path()).unwrap();
        let rows: Vec<&str> = content.lines().collect();
        assert_eq!(rows.len(), 3); // 表头 + 两个方向
        assert!(rows[0].starts_with("Line,Id,Year"));
        assert!(rows[1].starts_with("door-in,1,"));
        assert!(rows[1].ends_with(",2"));
        assert!(rows[2].starts_with("door-out,2,"));
        assert!(rows[2].ends_with(",1"));
    }
}
