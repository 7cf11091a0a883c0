//! 检测结果交换区 (每路摄像头一个固定块)
//! Detection exchange region, one fixed block per camera
//!
//! 块布局: `[头部: i32][记录: bbox 4×i32 + 置信度 f32 + 类别 u16] × K`,
//! 块在共享区内按 camera_id × block_size 偏移.
//!
//! 握手: 流水线发起检测前把头部写成 -1 (等待哨兵); 检测器先写完
//! 全部记录再写头部计数. 头部永远最后写, 最先读, 读者绝不会看到
//! 有计数却没有记录的状态

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use memmap2::MmapMut;

use super::ShmError;

/// 头部宽度 (i32 计数 / -1 等待哨兵)
const HEADER_SIZE: usize = 4;

/// 单条记录: 4 个 i32 框坐标 + f32 置信度 + u16 类别
const RECORD_SIZE: usize = 4 * 4 + 4 + 2;

/// 每块最多存放的记录数
pub const MAX_RECORDS: usize = 50;

/// 等待哨兵
const AWAITING: i32 = -1;

// 块尺寸按 8 字节对齐, 保证每块头部可原子访问
const BLOCK_SIZE: usize = (HEADER_SIZE + MAX_RECORDS * RECORD_SIZE + 7) & !7;

/// 一条检测记录
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub class_id: u16,
}

impl Detection {
    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.bbox[0].to_le_bytes());
        out[4..8].copy_from_slice(&self.bbox[1].to_le_bytes());
        out[8..12].copy_from_slice(&self.bbox[2].to_le_bytes());
        out[12..16].copy_from_slice(&self.bbox[3].to_le_bytes());
        out[16..20].copy_from_slice(&self.confidence.to_le_bytes());
        out[20..22].copy_from_slice(&self.class_id.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        let word = |i: usize| i32::from_le_bytes(raw[i..i + 4].try_into().unwrap());
        Self {
            bbox: [word(0), word(4), word(8), word(12)],
            confidence: f32::from_le_bytes(raw[16..20].try_into().unwrap()),
            class_id: u16::from_le_bytes(raw[20..22].try_into().unwrap()),
        }
    }
}

pub struct DetectionBoard {
    map: MmapMut,
    cameras: usize,
}

impl DetectionBoard {
    /// 建区 (写端: 检测器侧创建一次, 各方挂载)
    pub fn create(path: impl AsRef<Path>, cameras: usize) -> Result<Self, ShmError> {
        let len = cameras * BLOCK_SIZE;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map, cameras })
    }

    /// 挂载既有区域
    pub fn open(path: impl AsRef<Path>, cameras: usize) -> Result<Self, ShmError> {
        let need = cameras * BLOCK_SIZE;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < need {
            return Err(ShmError::RegionTooSmall { len, need });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map, cameras })
    }

    pub fn cameras(&self) -> usize {
        self.cameras
    }

    fn check_camera(&self, camera: usize) -> Result<(), ShmError> {
        if camera >= self.cameras {
            return Err(ShmError::CameraOutOfRange {
                camera,
                cameras: self.cameras,
            });
        }
        Ok(())
    }

    fn header(&self, camera: usize) -> &AtomicI32 {
        let off = camera * BLOCK_SIZE;
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicI32) }
    }

    fn record_offset(camera: usize, index: usize) -> usize {
        camera * BLOCK_SIZE + HEADER_SIZE + index * RECORD_SIZE
    }

    /// 消费端: 发起一次检测请求, 写入等待哨兵
    pub fn begin_request(&mut self, camera: usize) -> Result<(), ShmError> {
        self.check_camera(camera)?;
        self.header(camera).store(AWAITING, Ordering::SeqCst);
        Ok(())
    }

    /// 非阻塞读头部. None = 仍在等待, Some(n) = n 条记录就绪
    pub fn poll(&self, camera: usize) -> Result<Option<usize>, ShmError> {
        self.check_camera(camera)?;
        let count = self.header(camera).load(Ordering::SeqCst);
        if count < 0 {
            Ok(None)
        } else {
            Ok(Some(count as usize))
        }
    }

    /// 生产端: 先写全部记录, 最后发布计数
    pub fn write_records(&mut self, camera: usize, records: &[Detection]) -> Result<usize, ShmError> {
        self.check_camera(camera)?;
        if records.len() > MAX_RECORDS {
            return Err(ShmError::TooManyRecords {
                count: records.len(),
                max: MAX_RECORDS,
            });
        }
        for (i, rec) in records.iter().enumerate() {
            let off = Self::record_offset(camera, i);
            rec.encode(&mut self.map[off..off + RECORD_SIZE]);
        }
        // 记录落稳之后才发布计数
        self.header(camera).store(records.len() as i32, Ordering::SeqCst);
        Ok(records.len())
    }

    /// 按已发布的计数读回记录
    pub fn read_records(&self, camera: usize, count: usize) -> Result<Vec<Detection>, ShmError> {
        self.check_camera(camera)?;
        let count = count.min(MAX_RECORDS);
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let off = Self::record_offset(camera, i);
            out.push(Detection::decode(&self.map[off..off + RECORD_SIZE]));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(cameras: usize) -> (tempfile::TempDir, DetectionBoard) {
        let dir = tempfile::tempdir().unwrap();
        let board = DetectionBoard::create(dir.path().join("bboxes"), cameras).unwrap();
        (dir, board)
    }

    fn sample(n: usize) -> Vec<Detection> {
        (0..n)
            .map(|i| Detection {
                bbox: [i as i32, 10, i as i32 + 40, 80],
                confidence: 0.9 - i as f32 * 0.1,
                class_id: i as u16,
            })
            .collect()
    }

    // 握手: 请求后读者只看到等待哨兵, 记录发布后一次性看到完整计数
    #[test]
    fn awaiting_then_published_count() {
        let (_d, mut board) = board(2);
        board.begin_request(0).unwrap();
        assert_eq!(board.poll(0).unwrap(), None);

        let recs = sample(3);
        board.write_records(0, &recs).unwrap();
        assert_eq!(board.poll(0).unwrap(), Some(3));
        assert_eq!(board.read_records(0, 3).unwrap(), recs);
    }

    // 块按摄像头隔离
    #[test]
    fn cameras_do_not_interfere() {
        let (_d, mut board) = board(3);
        board.begin_request(1).unwrap();
        board.write_records(2, &sample(2)).unwrap();

        assert_eq!(board.poll(0).unwrap(), Some(0));
        assert_eq!(board.poll(1).unwrap(), None);
        assert_eq!(board.poll(2).unwrap(), Some(2));
    }

    // 空结果也是一次有效应答 (计数 0)
    #[test]
    fn empty_result_clears_awaiting() {
        let (_d, mut board) = board(1);
        board.begin_request(0).unwrap();
        board.write_records(0, &[]).unwrap();
        assert_eq!(board.poll(0).unwrap(), Some(0));
    }

    #[test]
    fn record_capacity_is_enforced() {
        let (_d, mut board) = board(1);
        let too_many = sample(MAX_RECORDS + 1);
        assert!(matches!(
            board.write_records(0, &too_many),
            Err(ShmError::TooManyRecords { .. })
        ));
    }

    // 读端挂载同一文件看到写端的发布
    #[test]
    fn reader_attaches_to_writer_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bboxes");
        let mut writer = DetectionBoard::create(&path, 1).unwrap();
        let reader = DetectionBoard::open(&path, 1).unwrap();

        let recs = sample(2);
        writer.write_records(0, &recs).unwrap();
        assert_eq!(reader.poll(0).unwrap(), Some(2));
        assert_eq!(reader.read_records(0, 2).unwrap(), recs);
    }

    #[test]
    fn camera_out_of_range_is_rejected() {
        let (_d, mut board) = board(1);
        assert!(matches!(
            board.begin_request(5),
            Err(ShmError::CameraOutOfRange { .. })
        ));
    }
}
