//! The Metal accelerator device.
//!
//! All dispatches are appended to one compute encoder and committed in
//! batches; at most one command buffer is in flight while the next one is
//! being built. Host-side inputs are staged through temporary device
//! buffers whose release is deferred to the committed buffer's completion
//! handler, guaranteeing the GPU can still read them during execution.
//!
//! F64 has no kernels on this backend. Every F64 op (and every op whose
//! dtype lacks hardware support, such as non-atomic reduce scatters)
//! synchronizes pending work and falls through to the scalar CPU kernels,
//! which operate directly on the shared-storage buffer contents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use block::ConcreteBlock;
use metal::{
    Buffer, CommandBuffer, CommandBufferRef, CommandQueue, ComputeCommandEncoder,
    ComputePipelineState, Library, MTLCommandBufferStatus, MTLSize,
};

use tg_tensor::device::{cpu, Device, DeviceType};
use tg_tensor::dtype::{DataType, Scalar, DATA_TYPE_COUNT};
use tg_tensor::error::{Result, TensorError};
use tg_tensor::shape::{Shape, Strides};

use crate::allocator::MetalAllocator;
use crate::cache::BufferCache;
use crate::shaders::SHADER_SOURCE;

/// Dispatches per command buffer before an automatic commit.
const MAX_CMD_BATCH_SIZE: usize = 1000;

/// Alignment of sub-page allocations.
const ALLOCATION_BYTE_ALIGNMENT: usize = 64;

/// Apple Silicon page size; larger allocations align to it.
const PAGE_SIZE: usize = 16384;

/// Element-count padding so kernels may read in vector units.
const VECTOR_COMPONENT_COUNT: usize = 4;

/// Threads per group in the parallel-reduction kernels (power of two).
const REDUCE_THREADGROUP_SIZE: usize = 1024;

/// The N-D transpose kernel decomposes indices into a fixed-size array.
const MAX_TRANSPOSE_DIMS: usize = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct MatSize {
    rows: u32,
    cols: u32,
}

type DtypeTable = [ComputePipelineState; DATA_TYPE_COUNT];

/// Precompiled pipelines, one per (kernel, dtype) and per dtype pair for
/// conversion copies. F64 slots hold the null kernel and are never
/// dispatched.
struct PipelineTable {
    add: DtypeTable,
    sub: DtypeTable,
    mul: DtypeTable,
    div: DtypeTable,
    pow: DtypeTable,
    add_s: DtypeTable,
    sub_s: DtypeTable,
    rsub_s: DtypeTable,
    mul_s: DtypeTable,
    div_s: DtypeTable,
    rdiv_s: DtypeTable,
    unary: DtypeTable,
    sqrt: DtypeTable,
    sin: DtypeTable,
    cos: DtypeTable,
    tanh: DtypeTable,
    log: DtypeTable,
    exp: DtypeTable,
    fill: DtypeTable,
    sum: DtypeTable,
    max: DtypeTable,
    matmul_32_32: DtypeTable,
    matmul_32_64: DtypeTable,
    matmul_32_128: DtypeTable,
    matmul_fallback: DtypeTable,
    transpose2d: DtypeTable,
    transpose2d_tiled: DtypeTable,
    transpose_nd: DtypeTable,
    broadcast: DtypeTable,
    reduce_to: DtypeTable,
    max_to: DtypeTable,
    copy: [DtypeTable; DATA_TYPE_COUNT],
}

fn dtype_suffix(dtype: DataType) -> &'static str {
    match dtype {
        DataType::F64 => "f64",
        DataType::F32 => "f32",
        DataType::F16 => "f16",
        DataType::BF16 => "bf16",
        DataType::I64 => "i64",
        DataType::I32 => "i32",
        DataType::I16 => "i16",
        DataType::I8 => "i8",
        DataType::U8 => "u8",
    }
}

fn pipeline(device: &metal::Device, library: &Library, name: &str) -> Result<ComputePipelineState> {
    let function = library
        .get_function(name, None)
        .map_err(|e| TensorError::DeviceFault(format!("missing kernel {name}: {e}")))?;
    device
        .new_compute_pipeline_state_with_function(&function)
        .map_err(|e| TensorError::DeviceFault(format!("pipeline for {name}: {e}")))
}

fn into_table(pipelines: Vec<ComputePipelineState>) -> DtypeTable {
    pipelines
        .try_into()
        .unwrap_or_else(|_| unreachable!("table size mismatch"))
}

impl PipelineTable {
    /// Resolve a pipeline per dtype, binding the null kernel where the
    /// backend has no hardware path.
    fn dtype_table(
        device: &metal::Device,
        library: &Library,
        base: &str,
        supported: fn(DataType) -> bool,
    ) -> Result<DtypeTable> {
        let mut pipelines = Vec::with_capacity(DATA_TYPE_COUNT);
        for &dtype in &DataType::ALL {
            let name = if supported(dtype) {
                format!("{base}_{}", dtype_suffix(dtype))
            } else {
                "null_kernel".to_string()
            };
            pipelines.push(pipeline(device, library, &name)?);
        }
        Ok(into_table(pipelines))
    }

    fn build(device: &metal::Device, library: &Library) -> Result<PipelineTable> {
        let non_f64 = |d: DataType| d != DataType::F64;
        let atomic = |d: DataType| matches!(d, DataType::F32 | DataType::I32);
        let table = |base: &str| Self::dtype_table(device, library, base, non_f64);

        let mut copy_rows = Vec::with_capacity(DATA_TYPE_COUNT);
        for &src in &DataType::ALL {
            let mut row = Vec::with_capacity(DATA_TYPE_COUNT);
            for &dst in &DataType::ALL {
                let name = if src == DataType::F64 || dst == DataType::F64 {
                    "null_kernel".to_string()
                } else {
                    format!("copy_{}_{}", dtype_suffix(src), dtype_suffix(dst))
                };
                row.push(pipeline(device, library, &name)?);
            }
            copy_rows.push(into_table(row));
        }
        let copy: [DtypeTable; DATA_TYPE_COUNT] = copy_rows
            .try_into()
            .unwrap_or_else(|_| unreachable!("table size mismatch"));

        Ok(PipelineTable {
            add: table("add")?,
            sub: table("sub")?,
            mul: table("mul")?,
            div: table("div")?,
            pow: table("pow")?,
            add_s: table("add_s")?,
            sub_s: table("sub_s")?,
            rsub_s: table("rsub_s")?,
            mul_s: table("mul_s")?,
            div_s: table("div_s")?,
            rdiv_s: table("rdiv_s")?,
            unary: table("unary")?,
            sqrt: table("sqrt")?,
            sin: table("sin")?,
            cos: table("cos")?,
            tanh: table("tanh")?,
            log: table("log")?,
            exp: table("exp")?,
            fill: table("fill")?,
            sum: table("sum")?,
            max: table("max")?,
            matmul_32_32: table("matmul_32_32")?,
            matmul_32_64: table("matmul_32_64")?,
            matmul_32_128: table("matmul_32_128")?,
            matmul_fallback: table("matmul_t")?,
            transpose2d: table("transpose2d")?,
            transpose2d_tiled: table("transpose2d_t")?,
            transpose_nd: table("transpose")?,
            broadcast: table("broadcast")?,
            reduce_to: Self::dtype_table(device, library, "reduce_to", atomic)?,
            max_to: Self::dtype_table(device, library, "max_to", atomic)?,
            copy,
        })
    }
}

struct State {
    queue: CommandQueue,
    cmd_buffer: CommandBuffer,
    encoder: ComputeCommandEncoder,
    committed: Option<CommandBuffer>,
    pipelines: PipelineTable,
    allocator: MetalAllocator,
    cache: Arc<Mutex<BufferCache>>,
    /// Live allocations handed out through `allocate`, keyed by contents
    /// address.
    alloc_map: HashMap<usize, Buffer>,
    /// Buffers referenced by the batch being built; recycled only by the
    /// completion handler of the commit that covers them.
    temp_buffers: Vec<Buffer>,
    batch_size: usize,
    max_batch_size: usize,
    current_working_set: usize,
    max_working_set: usize,
}

fn round_up(value: usize, step: usize) -> usize {
    value.div_ceil(step) * step
}

impl State {
    fn is_device_buffer(&self, ptr: *const u8) -> bool {
        self.alloc_map.contains_key(&(ptr as usize))
    }

    fn device_buffer(&self, ptr: *const u8) -> Buffer {
        self.alloc_map
            .get(&(ptr as usize))
            .cloned()
            .expect("destination must be device memory")
    }

    /// Allocate or reuse a device buffer of at least `size` bytes.
    fn new_buffer(&mut self, size: usize) -> Result<Buffer> {
        let size = size.max(1);
        let asize = if size < PAGE_SIZE {
            round_up(size, ALLOCATION_BYTE_ALIGNMENT)
        } else {
            round_up(size, PAGE_SIZE)
        };

        self.current_working_set += asize;
        if self.current_working_set * 2 >= self.max_working_set {
            self.commit();
        }

        if let Some(buffer) = self.cache.lock().unwrap().reuse(asize as u64) {
            return Ok(buffer);
        }
        if let Some(buffer) = self.allocator.alloc(asize as u64) {
            return Ok(buffer);
        }

        self.cache.lock().unwrap().clear();
        eprintln!("buffer cache cleared to satisfy an allocation; consider more device memory");
        if let Some(buffer) = self.allocator.alloc(asize as u64) {
            return Ok(buffer);
        }
        self.allocator.clear_empty_heaps();
        if let Some(buffer) = self.allocator.alloc(asize as u64) {
            return Ok(buffer);
        }
        Err(TensorError::AllocationFailure { bytes: size })
    }

    /// Wrap memory as a readable device buffer. Host memory is staged into
    /// a fresh buffer; device memory is used as-is.
    fn read_only_buffer(&mut self, ptr: *const u8, count: usize, elem_size: usize) -> Result<Buffer> {
        if self.is_device_buffer(ptr) {
            return Ok(self.device_buffer(ptr));
        }
        let aligned = round_up(count.max(1), VECTOR_COMPONENT_COUNT);
        let buffer = self.new_buffer(aligned * elem_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, buffer.contents() as *mut u8, count * elem_size);
        }
        Ok(buffer)
    }

    /// Defer the release of a staging buffer until the batch completes.
    fn free_temporary(&mut self, buffer: &Buffer) {
        if !self.is_device_buffer(buffer.contents() as *const u8) {
            self.temp_buffers.push(buffer.clone());
        }
    }

    fn commit(&mut self) {
        if self.batch_size == 0 {
            return;
        }

        // At most one buffer in flight.
        if let Some(previous) = self.committed.take() {
            previous.wait_until_completed();
        }

        self.encoder.end_encoding();

        let temps = std::mem::take(&mut self.temp_buffers);
        let cache = Arc::clone(&self.cache);
        let handler_temps = temps.clone();
        let block = ConcreteBlock::new(move |cb: &CommandBufferRef| {
            if cb.status() == MTLCommandBufferStatus::Error {
                eprintln!(
                    "metal command buffer failed after submission; \
                     subsequent device behavior is undefined"
                );
            }
            // The buffers may be read by the GPU until this point; only now
            // can they return to the pool.
            let mut cache = cache.lock().unwrap();
            for buffer in &handler_temps {
                cache.recycle(buffer.clone());
            }
        })
        .copy();
        self.cmd_buffer.add_completed_handler(&block);
        self.cmd_buffer.commit();

        // The just-committed temporaries are no longer live allocations.
        for buffer in &temps {
            self.alloc_map.remove(&(buffer.contents() as usize));
        }

        {
            let mut cache = self.cache.lock().unwrap();
            let limit = self.max_working_set as u64;
            if cache.size() > limit {
                let excess = cache.size() - limit;
                cache.reduce_size(excess);
            }
        }

        self.committed = Some(self.cmd_buffer.clone());
        self.cmd_buffer = self.queue.new_command_buffer().to_owned();
        self.encoder = self.cmd_buffer.new_compute_command_encoder().to_owned();

        self.max_batch_size = self.max_batch_size.max(self.batch_size);
        self.batch_size = 0;
        self.current_working_set = 0;
    }

    fn synchronize(&mut self) {
        self.commit();
        if let Some(committed) = &self.committed {
            committed.wait_until_completed();
        }
    }

    fn commit_batch(&mut self) {
        self.batch_size += 1;
        if self.batch_size >= MAX_CMD_BATCH_SIZE {
            self.commit();
        }
    }

    fn linear_dispatch(&self, pso: &ComputePipelineState, size: usize) {
        let w = pso
            .max_total_threads_per_threadgroup()
            .min(size.max(1) as u64);
        self.encoder.dispatch_threads(
            MTLSize::new(size.max(1) as u64, 1, 1),
            MTLSize::new(w, 1, 1),
        );
    }

    fn encode_two(&self, pso: &ComputePipelineState, a: &Buffer, out: &Buffer, size: usize) {
        self.encoder.set_compute_pipeline_state(pso);
        self.encoder.set_buffer(0, Some(a), 0);
        self.encoder.set_buffer(1, Some(out), 0);
        self.linear_dispatch(pso, size);
    }

    fn encode_three(
        &self,
        pso: &ComputePipelineState,
        a: &Buffer,
        b: &Buffer,
        out: &Buffer,
        size: usize,
    ) {
        self.encoder.set_compute_pipeline_state(pso);
        self.encoder.set_buffer(0, Some(a), 0);
        self.encoder.set_buffer(1, Some(b), 0);
        self.encoder.set_buffer(2, Some(out), 0);
        self.linear_dispatch(pso, size);
    }

    fn encode_scalar(
        &self,
        pso: &ComputePipelineState,
        a: &Buffer,
        scalar: Scalar,
        out: &Buffer,
        size: usize,
    ) {
        let (bytes, len) = scalar.le_bytes();
        self.encoder.set_compute_pipeline_state(pso);
        self.encoder.set_buffer(0, Some(a), 0);
        self.encoder
            .set_bytes(1, len as u64, bytes.as_ptr() as *const _);
        self.encoder.set_buffer(2, Some(out), 0);
        self.linear_dispatch(pso, size);
    }
}

/// A Metal-backed [`Device`]. One instance owns its command queue, pipeline
/// table, allocator, and buffer cache; tensors hold it behind `Arc`.
pub struct MetalDevice {
    state: Mutex<State>,
}

// Metal handles are confined behind the state lock; the cache is locked
// independently by the completion handler.
unsafe impl Send for MetalDevice {}
unsafe impl Sync for MetalDevice {}

impl MetalDevice {
    /// Create a backend on the system default device.
    pub fn new() -> Result<MetalDevice> {
        Self::with_device_index(0)
    }

    /// Create a backend on the device at `index` in the system device list.
    pub fn with_device_index(index: usize) -> Result<MetalDevice> {
        let mut devices = metal::Device::all();
        if index >= devices.len() {
            return Err(TensorError::DeviceFault(format!(
                "no metal device at index {index} ({} available)",
                devices.len()
            )));
        }
        let device = devices.swap_remove(index);

        let max_working_set = (device.recommended_max_working_set_size() as f64 * 0.7) as usize;

        let options = metal::CompileOptions::new();
        let library = device
            .new_library_with_source(SHADER_SOURCE, &options)
            .map_err(|e| TensorError::DeviceFault(format!("shader compilation failed: {e}")))?;
        let pipelines = PipelineTable::build(&device, &library)?;

        let queue = device.new_command_queue();
        let cmd_buffer = queue.new_command_buffer().to_owned();
        let encoder = cmd_buffer.new_compute_command_encoder().to_owned();
        let allocator = MetalAllocator::new(device, ALLOCATION_BYTE_ALIGNMENT as u64);

        Ok(MetalDevice {
            state: Mutex::new(State {
                queue,
                cmd_buffer,
                encoder,
                committed: None,
                pipelines,
                allocator,
                cache: Arc::new(Mutex::new(BufferCache::new())),
                alloc_map: HashMap::new(),
                temp_buffers: Vec::new(),
                batch_size: 0,
                max_batch_size: 0,
                current_working_set: 0,
                max_working_set,
            }),
        })
    }

    /// Largest number of dispatches observed in one command buffer.
    pub fn max_batch_size(&self) -> usize {
        self.state.lock().unwrap().max_batch_size
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Flush and wait, then run a CPU kernel over the shared-storage
    /// contents.
    fn fall_through(&self, f: impl FnOnce()) {
        self.with_state(|st| st.synchronize());
        f();
    }

    fn run_binary(
        &self,
        select: fn(&PipelineTable) -> &DtypeTable,
        a: *const u8,
        b: *const u8,
        size: usize,
        result: *mut u8,
        dtype: DataType,
    ) {
        self.with_state(|st| {
            let pso = select(&st.pipelines)[dtype.index()].clone();
            let elem = dtype.size_in_bytes();
            let buf_a = st.read_only_buffer(a, size, elem).expect("device allocation failed");
            let buf_b = st.read_only_buffer(b, size, elem).expect("device allocation failed");
            let buf_out = st.device_buffer(result);
            st.encode_three(&pso, &buf_a, &buf_b, &buf_out, size);
            st.free_temporary(&buf_a);
            st.free_temporary(&buf_b);
            st.commit_batch();
        })
    }

    fn run_unary(
        &self,
        select: fn(&PipelineTable) -> &DtypeTable,
        a: *const u8,
        size: usize,
        result: *mut u8,
        dtype: DataType,
    ) {
        self.with_state(|st| {
            let pso = select(&st.pipelines)[dtype.index()].clone();
            let elem = dtype.size_in_bytes();
            let buf_a = st.read_only_buffer(a, size, elem).expect("device allocation failed");
            let buf_out = st.device_buffer(result);
            st.encode_two(&pso, &buf_a, &buf_out, size);
            st.free_temporary(&buf_a);
            st.commit_batch();
        })
    }

    fn run_scalar(
        &self,
        select: fn(&PipelineTable) -> &DtypeTable,
        a: *const u8,
        scalar: Scalar,
        size: usize,
        result: *mut u8,
        dtype: DataType,
    ) {
        self.with_state(|st| {
            let pso = select(&st.pipelines)[dtype.index()].clone();
            let elem = dtype.size_in_bytes();
            let buf_a = st.read_only_buffer(a, size, elem).expect("device allocation failed");
            let buf_out = st.device_buffer(result);
            // The scalar converts to the kernel dtype host-side.
            st.encode_scalar(&pso, &buf_a, scalar.cast(dtype), &buf_out, size);
            st.free_temporary(&buf_a);
            st.commit_batch();
        })
    }

    /// Ping-pong parallel reduction: each pass folds windows of
    /// [`REDUCE_THREADGROUP_SIZE`] elements into one partial until a single
    /// element remains, which is copied into the destination.
    fn run_reduction(
        &self,
        select: fn(&PipelineTable) -> &DtypeTable,
        a: *const u8,
        size: usize,
        result: *mut u8,
        dtype: DataType,
        mean_divisor: Option<usize>,
    ) {
        self.with_state(|st| {
            let pso = select(&st.pipelines)[dtype.index()].clone();
            let elem = dtype.size_in_bytes();
            let group = REDUCE_THREADGROUP_SIZE;

            let src = st.read_only_buffer(a, size, elem).expect("device allocation failed");
            let scratch_len = size.div_ceil(group).max(1);
            let scratch = [
                st.new_buffer(scratch_len * elem).expect("device allocation failed"),
                st.new_buffer(scratch_len * elem).expect("device allocation failed"),
            ];

            let mut n = size.max(1);
            let mut input = src.clone();
            let mut cursor = 0;
            while n > 1 {
                let groups = n.div_ceil(group);
                let output = &scratch[cursor];

                st.encoder.set_compute_pipeline_state(&pso);
                st.encoder.set_buffer(0, Some(&input), 0);
                st.encoder.set_buffer(1, Some(output), 0);
                let bound = n as u32;
                st.encoder
                    .set_bytes(2, 4, &bound as *const u32 as *const _);
                st.encoder.dispatch_thread_groups(
                    MTLSize::new(groups as u64, 1, 1),
                    MTLSize::new(group as u64, 1, 1),
                );
                st.commit_batch();

                input = output.clone();
                cursor ^= 1;
                n = groups;
            }

            // Move the surviving element into the destination.
            let buf_out = st.device_buffer(result);
            let copy_pso = st.pipelines.copy[dtype.index()][dtype.index()].clone();
            st.encode_two(&copy_pso, &input, &buf_out, 1);
            st.commit_batch();

            if let Some(count) = mean_divisor {
                let div_pso = st.pipelines.div_s[dtype.index()].clone();
                let divisor = Scalar::F64(count as f64).cast(dtype);
                st.encode_scalar(&div_pso, &buf_out, divisor, &buf_out, 1);
                st.commit_batch();
            }

            st.free_temporary(&src);
            st.free_temporary(&scratch[0]);
            st.free_temporary(&scratch[1]);
        })
    }

    /// Stage a `usize` slice as a `ulong` device buffer.
    fn stage_indices(st: &mut State, values: &[usize]) -> Buffer {
        let wide: Vec<u64> = values.iter().map(|&v| v as u64).collect();
        let buffer = st
            .read_only_buffer(wide.as_ptr() as *const u8, wide.len(), 8)
            .expect("device allocation failed");
        buffer
    }

    /// Shared driver for the translation-indexed gather/scatter kernels.
    /// `first_shape` and `second_shape` bind to the kernel's shape slots in
    /// order; `grid` is one thread per source-or-destination element
    /// depending on the kernel, and `src_count` is the element count of the
    /// source buffer being staged.
    #[allow(clippy::too_many_arguments)]
    fn run_translation(
        &self,
        select: fn(&PipelineTable) -> &DtypeTable,
        src: *const u8,
        src_count: usize,
        dst: *mut u8,
        grid: usize,
        first_shape: &Shape,
        second_shape: &Shape,
        dtype: DataType,
    ) {
        self.with_state(|st| {
            let pso = select(&st.pipelines)[dtype.index()].clone();
            let elem = dtype.size_in_bytes();
            let buf_src = st
                .read_only_buffer(src, src_count, elem)
                .expect("device allocation failed");
            let buf_dst = st.device_buffer(dst);
            let buf_first = Self::stage_indices(st, first_shape.dims());
            let buf_second = Self::stage_indices(st, second_shape.dims());
            let first_ndim = first_shape.ndim() as u64;
            let second_ndim = second_shape.ndim() as u64;

            st.encoder.set_compute_pipeline_state(&pso);
            st.encoder.set_buffer(0, Some(&buf_src), 0);
            st.encoder.set_buffer(1, Some(&buf_dst), 0);
            st.encoder.set_buffer(2, Some(&buf_first), 0);
            st.encoder
                .set_bytes(3, 8, &first_ndim as *const u64 as *const _);
            st.encoder.set_buffer(4, Some(&buf_second), 0);
            st.encoder
                .set_bytes(5, 8, &second_ndim as *const u64 as *const _);
            st.linear_dispatch(&pso, grid);

            st.free_temporary(&buf_src);
            st.free_temporary(&buf_first);
            st.free_temporary(&buf_second);
            st.commit_batch();
        })
    }
}

impl Device for MetalDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Metal
    }

    fn allocate(&self, bytes: usize) -> Result<*mut u8> {
        self.with_state(|st| {
            let buffer = st.new_buffer(bytes)?;
            let ptr = buffer.contents() as *mut u8;
            st.alloc_map.insert(ptr as usize, buffer);
            Ok(ptr)
        })
    }

    fn allocate_typed(&self, count: usize, dtype: DataType) -> Result<*mut u8> {
        self.allocate(round_up(count.max(1), VECTOR_COMPONENT_COUNT) * dtype.size_in_bytes())
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _bytes: usize) {
        self.with_state(|st| {
            match st.alloc_map.get(&(ptr as usize)).cloned() {
                // The buffer may back commands in the batch being built;
                // recycling waits for the completion handler.
                Some(buffer) => st.temp_buffers.push(buffer),
                None => eprintln!("deallocate of a pointer this device never allocated"),
            }
        })
    }

    unsafe fn add(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::add(a, b, size, result, dtype));
            return;
        }
        self.run_binary(|p| &p.add, a, b, size, result, dtype);
    }

    unsafe fn sub(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::sub(a, b, size, result, dtype));
            return;
        }
        self.run_binary(|p| &p.sub, a, b, size, result, dtype);
    }

    unsafe fn mul(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::mul(a, b, size, result, dtype));
            return;
        }
        self.run_binary(|p| &p.mul, a, b, size, result, dtype);
    }

    unsafe fn div(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::div(a, b, size, result, dtype));
            return;
        }
        self.run_binary(|p| &p.div, a, b, size, result, dtype);
    }

    unsafe fn pow(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::pow(a, b, size, result, dtype));
            return;
        }
        self.run_binary(|p| &p.pow, a, b, size, result, dtype);
    }

    unsafe fn add_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::add_scalar(a, scalar, size, result, dtype));
            return;
        }
        self.run_scalar(|p| &p.add_s, a, scalar, size, result, dtype);
    }

    unsafe fn sub_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::sub_scalar(a, scalar, size, result, dtype));
            return;
        }
        self.run_scalar(|p| &p.sub_s, a, scalar, size, result, dtype);
    }

    unsafe fn rev_sub_scalar(&self, scalar: Scalar, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::rev_sub_scalar(scalar, a, size, result, dtype));
            return;
        }
        self.run_scalar(|p| &p.rsub_s, a, scalar, size, result, dtype);
    }

    unsafe fn mul_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::mul_scalar(a, scalar, size, result, dtype));
            return;
        }
        self.run_scalar(|p| &p.mul_s, a, scalar, size, result, dtype);
    }

    unsafe fn div_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::div_scalar(a, scalar, size, result, dtype));
            return;
        }
        self.run_scalar(|p| &p.div_s, a, scalar, size, result, dtype);
    }

    unsafe fn rev_div_scalar(&self, scalar: Scalar, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::rev_div_scalar(scalar, a, size, result, dtype));
            return;
        }
        self.run_scalar(|p| &p.rdiv_s, a, scalar, size, result, dtype);
    }

    unsafe fn unary(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::unary(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.unary, a, size, result, dtype);
    }

    unsafe fn sqrt(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::sqrt(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.sqrt, a, size, result, dtype);
    }

    unsafe fn sin(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::sin(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.sin, a, size, result, dtype);
    }

    unsafe fn cos(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::cos(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.cos, a, size, result, dtype);
    }

    unsafe fn tanh(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::tanh(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.tanh, a, size, result, dtype);
    }

    unsafe fn log(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::log(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.log, a, size, result, dtype);
    }

    unsafe fn exp(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::exp(a, size, result, dtype));
            return;
        }
        self.run_unary(|p| &p.exp, a, size, result, dtype);
    }

    unsafe fn fill(&self, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::fill(scalar, size, result, dtype));
            return;
        }
        self.with_state(|st| {
            let pso = st.pipelines.fill[dtype.index()].clone();
            let buf_out = st.device_buffer(result);
            let (bytes, len) = scalar.cast(dtype).le_bytes();
            st.encoder.set_compute_pipeline_state(&pso);
            st.encoder
                .set_bytes(0, len as u64, bytes.as_ptr() as *const _);
            st.encoder.set_buffer(1, Some(&buf_out), 0);
            st.linear_dispatch(&pso, size);
            st.commit_batch();
        })
    }

    unsafe fn sum(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::sum(a, size, result, dtype));
            return;
        }
        self.run_reduction(|p| &p.sum, a, size, result, dtype, None);
    }

    unsafe fn mean(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::mean(a, size, result, dtype));
            return;
        }
        self.run_reduction(|p| &p.sum, a, size, result, dtype, Some(size));
    }

    unsafe fn max(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::max(a, size, result, dtype));
            return;
        }
        self.run_reduction(|p| &p.max, a, size, result, dtype, None);
    }

    unsafe fn matmul(
        &self,
        a: *const u8,
        a_shape: &Shape,
        b: *const u8,
        b_shape: &Shape,
        result: *mut u8,
        dtype: DataType,
    ) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::matmul(a, a_shape, b, b_shape, result, dtype));
            return;
        }
        self.with_state(|st| {
            let elem = dtype.size_in_bytes();
            let (m, k) = (a_shape.dim(0), a_shape.dim(1));
            let n = b_shape.dim(1);

            let buf_a = st.read_only_buffer(a, m * k, elem).expect("device allocation failed");
            let buf_b = st.read_only_buffer(b, k * n, elem).expect("device allocation failed");
            let buf_c = st.device_buffer(result);

            let a_size = MatSize { rows: m as u32, cols: k as u32 };
            let b_size = MatSize { rows: k as u32, cols: n as u32 };

            // Fast tiles need 32-aligned K and N and a float dtype; the tile
            // height follows the divisibility of M.
            let tiled_ok = k % 32 == 0
                && n % 32 == 0
                && matches!(dtype, DataType::F32 | DataType::F16 | DataType::BF16);

            let (pso, groups, threads) = if m % 128 == 0 && tiled_ok {
                (
                    st.pipelines.matmul_32_128[dtype.index()].clone(),
                    MTLSize::new((n / 32) as u64, (m / 128) as u64, 1),
                    MTLSize::new(32, 4, 1),
                )
            } else if m % 64 == 0 && tiled_ok {
                (
                    st.pipelines.matmul_32_64[dtype.index()].clone(),
                    MTLSize::new((n / 32) as u64, (m / 64) as u64, 1),
                    MTLSize::new(32, 2, 1),
                )
            } else if m % 32 == 0 && tiled_ok {
                (
                    st.pipelines.matmul_32_32[dtype.index()].clone(),
                    MTLSize::new((n / 32) as u64, (m / 32) as u64, 1),
                    MTLSize::new(32, 1, 1),
                )
            } else {
                (
                    st.pipelines.matmul_fallback[dtype.index()].clone(),
                    MTLSize::new(n.div_ceil(64) as u64, m.div_ceil(64) as u64, 1),
                    MTLSize::new(64, 1, 1),
                )
            };

            st.encoder.set_compute_pipeline_state(&pso);
            st.encoder.set_buffer(0, Some(&buf_a), 0);
            st.encoder.set_buffer(1, Some(&buf_b), 0);
            st.encoder.set_buffer(2, Some(&buf_c), 0);
            st.encoder.set_bytes(
                3,
                std::mem::size_of::<MatSize>() as u64,
                &a_size as *const MatSize as *const _,
            );
            st.encoder.set_bytes(
                4,
                std::mem::size_of::<MatSize>() as u64,
                &b_size as *const MatSize as *const _,
            );
            st.encoder.dispatch_thread_groups(groups, threads);

            st.free_temporary(&buf_a);
            st.free_temporary(&buf_b);
            st.commit_batch();
        })
    }

    unsafe fn transpose(
        &self,
        dim0: usize,
        dim1: usize,
        data: *const u8,
        shape: &Shape,
        strides: &Strides,
        new_strides: &Strides,
        size: usize,
        result: *mut u8,
        dtype: DataType,
    ) {
        if dtype == DataType::F64 || shape.ndim() > MAX_TRANSPOSE_DIMS {
            self.fall_through(|| {
                cpu::transpose(dim0, dim1, data, shape, strides, new_strides, size, result, dtype)
            });
            return;
        }
        self.with_state(|st| {
            let elem = dtype.size_in_bytes();

            // Matrix transposes take the simplified 2-D path, tiled when the
            // dimensions divide evenly.
            if shape.ndim() == 2 && dim0 == 0 && dim1 == 1 {
                let (rows, cols) = (shape.dim(0), shape.dim(1));
                let buf_in = st.read_only_buffer(data, size, elem).expect("device allocation failed");
                let buf_out = st.device_buffer(result);
                let mat = MatSize { rows: rows as u32, cols: cols as u32 };

                if rows % 32 == 0 && cols % 32 == 0 {
                    let pso = st.pipelines.transpose2d_tiled[dtype.index()].clone();
                    st.encoder.set_compute_pipeline_state(&pso);
                    st.encoder.set_buffer(0, Some(&buf_in), 0);
                    st.encoder.set_buffer(1, Some(&buf_out), 0);
                    st.encoder.set_bytes(
                        2,
                        std::mem::size_of::<MatSize>() as u64,
                        &mat as *const MatSize as *const _,
                    );
                    st.encoder.dispatch_thread_groups(
                        MTLSize::new((cols / 32) as u64, (rows / 32) as u64, 1),
                        MTLSize::new(32, 32, 1),
                    );
                } else {
                    let pso = st.pipelines.transpose2d[dtype.index()].clone();
                    st.encoder.set_compute_pipeline_state(&pso);
                    st.encoder.set_buffer(0, Some(&buf_in), 0);
                    st.encoder.set_buffer(1, Some(&buf_out), 0);
                    st.encoder.set_bytes(
                        2,
                        std::mem::size_of::<MatSize>() as u64,
                        &mat as *const MatSize as *const _,
                    );
                    st.encoder.dispatch_threads(
                        MTLSize::new(cols as u64, rows as u64, 1),
                        MTLSize::new(32, 32, 1),
                    );
                }

                st.free_temporary(&buf_in);
                st.commit_batch();
                return;
            }

            let pso = st.pipelines.transpose_nd[dtype.index()].clone();
            let buf_in = st.read_only_buffer(data, size, elem).expect("device allocation failed");
            let buf_out = st.device_buffer(result);
            let buf_strides = Self::stage_indices(st, strides.as_slice());
            let buf_new_strides = Self::stage_indices(st, new_strides.as_slice());
            let d0 = dim0 as u64;
            let d1 = dim1 as u64;
            let ndim = shape.ndim() as u64;

            st.encoder.set_compute_pipeline_state(&pso);
            st.encoder.set_buffer(0, Some(&buf_in), 0);
            st.encoder.set_buffer(1, Some(&buf_out), 0);
            st.encoder.set_bytes(2, 8, &d0 as *const u64 as *const _);
            st.encoder.set_bytes(3, 8, &d1 as *const u64 as *const _);
            st.encoder.set_buffer(4, Some(&buf_strides), 0);
            st.encoder.set_bytes(5, 8, &ndim as *const u64 as *const _);
            st.encoder.set_buffer(6, Some(&buf_new_strides), 0);
            st.linear_dispatch(&pso, size);

            st.free_temporary(&buf_in);
            st.free_temporary(&buf_strides);
            st.free_temporary(&buf_new_strides);
            st.commit_batch();
        })
    }

    unsafe fn copy(&self, src: *const u8, src_dtype: DataType, dst: *mut u8, dst_dtype: DataType, size: usize) {
        if src_dtype == DataType::F64 || dst_dtype == DataType::F64 {
            self.fall_through(|| cpu::copy(src, src_dtype, dst, dst_dtype, size));
            return;
        }
        self.with_state(|st| {
            let pso = st.pipelines.copy[src_dtype.index()][dst_dtype.index()].clone();
            let buf_src = st
                .read_only_buffer(src, size, src_dtype.size_in_bytes())
                .expect("device allocation failed");
            let buf_dst = st.device_buffer(dst);
            st.encode_two(&pso, &buf_src, &buf_dst, size);
            st.free_temporary(&buf_src);
            st.commit_batch();
        })
    }

    unsafe fn copy_immediate(&self, src: *const u8, src_dtype: DataType, dst: *mut u8, dst_dtype: DataType, size: usize) {
        self.copy(src, src_dtype, dst, dst_dtype, size);
        self.with_state(|st| st.synchronize());
    }

    unsafe fn broadcast_to(
        &self,
        src: *const u8,
        dst: *mut u8,
        size: usize,
        shape: &Shape,
        new_shape: &Shape,
        dtype: DataType,
    ) {
        if dtype == DataType::F64 {
            self.fall_through(|| cpu::broadcast_to(src, dst, size, shape, new_shape, dtype));
            return;
        }
        self.run_translation(
            |p| &p.broadcast,
            src,
            shape.numel(),
            dst,
            size,
            shape,
            new_shape,
            dtype,
        );
    }

    unsafe fn reduce_to(
        &self,
        src: *const u8,
        dst: *mut u8,
        size: usize,
        shape: &Shape,
        new_shape: &Shape,
        dtype: DataType,
    ) {
        // Atomic accumulation exists only for F32 and I32. The thread
        // scheduling makes the float accumulation order unspecified, so
        // results may differ across runs within rounding error.
        if !matches!(dtype, DataType::F32 | DataType::I32) {
            self.fall_through(|| cpu::reduce_to(src, dst, size, shape, new_shape, dtype));
            return;
        }
        self.run_translation(|p| &p.reduce_to, src, size, dst, size, new_shape, shape, dtype);
    }

    unsafe fn max_to(
        &self,
        src: *const u8,
        dst: *mut u8,
        size: usize,
        shape: &Shape,
        new_shape: &Shape,
        dtype: DataType,
    ) {
        if !matches!(dtype, DataType::F32 | DataType::I32) {
            self.fall_through(|| cpu::max_to(src, dst, size, shape, new_shape, dtype));
            return;
        }
        self.run_translation(|p| &p.max_to, src, size, dst, size, new_shape, shape, dtype);
    }

    fn commit_and_wait(&self) {
        self.with_state(|st| st.synchronize());
    }
}

impl Drop for MetalDevice {
    fn drop(&mut self) {
        if let Ok(mut st) = self.state.lock() {
            if st.batch_size > 0 {
                eprintln!("warning: queued tensor operations at teardown; missing a synchronize()?");
            }
            st.synchronize();
            st.encoder.end_encoding();
            st.cache.lock().unwrap().clear();
        }
    }
}
