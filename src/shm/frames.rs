//! 帧环形缓冲区 (mmap 文件上的固定槽位)
//! Frame ring buffer over a memory-mapped file
//!
//! 布局: N 个循环槽位 + 1 个保留槽位, 每槽 = `[头部: u64][负载: w*h*d 字节]`.
//! 头部 0 表示空闲, 非 0 表示生产该帧的序号.
//!
//! 协议:
//! 1. 生产者先写负载, 再以 SeqCst 原子写头部
//! 2. 消费者先以 SeqCst 原子读头部, 看到非 0 才读负载 (read 的返回类型强制了这一点)
//! 3. 目标槽位头部非 0 时写入是空操作, 返回 0 字节 (丢帧即背压, 从不阻塞)
//! 4. 只有流水线在该帧全部工作完成后调用 mark_consumed 把头部清零
//!
//! 保留槽位在循环游标之外, retain_last 把最近处理完的帧复制进去,
//! 让显示等慢速观察者不受游标推进影响

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use super::ShmError;

/// 头部宽度 (u64 序号)
const HEADER_SIZE: usize = 8;

/// 一帧的几何尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl FrameShape {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.width * self.height * self.depth
    }
}

pub struct FrameRing {
    map: MmapMut,
    shape: FrameShape,
    slots: usize,
    slot_size: usize,
    // 下一个写入目标槽位 (仅写端使用)
    write_idx: usize,
}

impl FrameRing {
    /// 写端建区: 创建/截断文件并映射. 同一 id 只允许一个写者
    pub fn create(path: impl AsRef<Path>, shape: FrameShape, slots: usize) -> Result<Self, ShmError> {
        let slot_size = Self::slot_size_for(&shape);
        let len = slot_size * (slots + 1);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            shape,
            slots,
            slot_size,
            write_idx: 0,
        })
    }

    /// 读端挂载既有区域. 写端必须先完成 create
    pub fn open(path: impl AsRef<Path>, shape: FrameShape, slots: usize) -> Result<Self, ShmError> {
        let slot_size = Self::slot_size_for(&shape);
        let need = slot_size * (slots + 1);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < need {
            return Err(ShmError::RegionTooSmall { len, need });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            shape,
            slots,
            slot_size,
            write_idx: 0,
        })
    }

    // 槽位按 8 字节对齐, 头部的原子访问依赖这一点
    fn slot_size_for(shape: &FrameShape) -> usize {
        (HEADER_SIZE + shape.frame_size() + 7) & !7
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// 保留槽位的下标 (循环下标空间 [0, N) 之外的固定位置)
    pub fn last_index(&self) -> usize {
        self.slots
    }

    /// 下一次写入的目标槽位 (仅写端有意义)
    pub fn write_index(&self) -> usize {
        self.write_idx
    }

    fn check_index(&self, index: usize) -> Result<(), ShmError> {
        if index > self.slots {
            return Err(ShmError::IndexOutOfRange {
                index,
                slots: self.slots,
            });
        }
        Ok(())
    }

    fn header(&self, index: usize) -> &AtomicU64 {
        let off = index * self.slot_size;
        // 映射按页对齐且槽位尺寸为 8 的倍数, 头部天然对齐
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicU64) }
    }

    fn payload_bounds(&self, index: usize) -> (usize, usize) {
        let start = index * self.slot_size + HEADER_SIZE;
        (start, start + self.shape.frame_size())
    }

    /// 写入下一帧. 目标槽位未被消费时丢帧, 返回 0; 成功返回负载字节数.
    /// 序号 0 保留给空闲哨兵, 不可用作帧序号
    pub fn write(&mut self, frame: &[u8], seq: u64) -> Result<usize, ShmError> {
        if seq == 0 {
            return Err(ShmError::ReservedSequence);
        }
        let frame_size = self.shape.frame_size();
        if frame.len() != frame_size {
            return Err(ShmError::FrameSize {
                got: frame.len(),
                expected: frame_size,
            });
        }

        let idx = self.write_idx;
        if self.header(idx).load(Ordering::SeqCst) != 0 {
            // 消费端落后: 丢掉最新帧, 游标原地等待
            return Ok(0);
        }

        let (start, end) = self.payload_bounds(idx);
        self.map[start..end].copy_from_slice(frame);
        // 负载可见之后才发布序号
        self.header(idx).store(seq, Ordering::SeqCst);

        self.write_idx = (idx + 1) % self.slots;
        Ok(frame_size)
    }

    /// 头部查询, 不动游标. 0 = 空闲
    pub fn read_header(&self, index: usize) -> Result<u64, ShmError> {
        self.check_index(index)?;
        Ok(self.header(index).load(Ordering::SeqCst))
    }

    /// 读一个槽位. 头部为 0 (尚无已发布的帧) 时返回 None,
    /// 调用方拿不到未发布的负载
    pub fn read(&self, index: usize) -> Result<Option<(u64, &[u8])>, ShmError> {
        self.check_index(index)?;
        let seq = self.header(index).load(Ordering::SeqCst);
        if seq == 0 {
            return Ok(None);
        }
        let (start, end) = self.payload_bounds(index);
        Ok(Some((seq, &self.map[start..end])))
    }

    /// 把槽位头部清零交还生产者. 只有流水线在该帧全部工作
    /// (跟踪, 检测, 通知) 完成后调用
    pub fn mark_consumed(&mut self, index: usize) -> Result<(), ShmError> {
        self.check_index(index)?;
        self.header(index).store(0, Ordering::SeqCst);
        Ok(())
    }

    /// 把一个槽位的内容复制进保留槽位, 供晚到的观察者独立读取
    pub fn retain_last(&mut self, index: usize) -> Result<(), ShmError> {
        self.check_index(index)?;
        let seq = self.header(index).load(Ordering::SeqCst);
        let (src_start, src_end) = self.payload_bounds(index);
        let (dst_start, _) = self.payload_bounds(self.slots);
        self.map.copy_within(src_start..src_end, dst_start);
        self.header(self.slots).store(seq, Ordering::SeqCst);
        Ok(())
    }

    /// 读保留槽位 (最近一帧处理完的画面)
    pub fn read_last(&self) -> Result<Option<(u64, &[u8])>, ShmError> {
        self.read(self.slots)
    }
}
