// -------------------------------------------------------------------------------------------------

/// Split the given interleaved buffer into planar channel vectors.
pub fn interleaved_to_planar(interleaved: &[f32], channel_count: usize) -> Vec<Vec<f32>> {
    assert!(channel_count > 0, "Need at least one channel");
    let frame_count = interleaved.len() / channel_count;
    match channel_count {
        1 => vec![interleaved[..frame_count].to_vec()],
        2 => {
            let mut left = Vec::with_capacity(frame_count);
            let mut right = Vec::with_capacity(frame_count);
            for frame in interleaved.chunks_exact(2) {
                left.push(frame[0]);
                right.push(frame[1]);
            }
            vec![left, right]
        }
        _ => {
            let mut planar = vec![Vec::with_capacity(frame_count); channel_count];
            for frame in interleaved.chunks_exact(channel_count) {
                for (channel, value) in planar.iter_mut().zip(frame) {
                    channel.push(*value);
                }
            }
            planar
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Mix the given planar channels down to a single mono channel.
pub fn planar_to_mono(planar: &[Vec<f32>]) -> Vec<f32> {
    match planar.len() {
        0 => Vec::new(),
        1 => planar[0].clone(),
        channel_count => {
            let frame_count = planar.iter().map(Vec::len).min().unwrap_or(0);
            let scale = 1.0 / channel_count as f32;
            (0..frame_count)
                .map(|frame| planar.iter().map(|c| c[frame]).sum::<f32>() * scale)
                .collect()
        }
    }
}

// -------------------------------------------------------------------------------------------------
