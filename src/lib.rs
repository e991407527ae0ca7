/*!
Unified State Codec — lossless compression for structured text streams.

The codec extracts the latent record structure of a log or agent-trace
stream (a small bank of line templates plus typed parameter slots) and
encodes template identities and parameters on separate, specialized
channels. Repetitive structured data compresses far beyond what byte-level
compressors reach, while roundtrip stays bit-exact.

## Pipeline

1. **Canonicalize** — volatile tokens (timestamps, UUIDs, long hex, long
   integers) become sentinels; the originals ride a typed side vector.
2. **Mine** — canonical lines collapse into templates with wildcard slots;
   lines that do not template become raw rows behind a row-order mask.
3. **Channelize** — template ids go through a move-to-front transform into
   bit-packed positions; each slot's values form a typed column stream
   (delta ints, per-octet IP deltas, fixed-width hex, dictionary indexes,
   or raw bytes as the safety floor).
4. **Packetize** — one DICT packet carries the frozen bank; each window of
   rows becomes one small DATA packet.
5. **Frame** — packets are length-prefix framed; cold mode adds a zstd pass
   primed with a dictionary trained on the head of the stream.

## Modes

| mode | composition | purpose |
|------|-------------|---------|
| `stream` | DICT + DATA | live appending, incremental |
| `hot-lite-full` | DICT + DATA + row index | range queries + full restore |
| `cold` | DICT + DATA + entropy pass | maximum-ratio archive |

```no_run
use usc::{encode_to_container, decode_container, Config};

let lines = ["job 42 ok\n", "job 43 ok\n"];
let blob = encode_to_container(lines.iter(), &Config::default()).unwrap();
let restored = decode_container(&blob).unwrap();
assert_eq!(restored[0], b"job 42 ok\n");
```
*/

pub mod bits;
pub mod canon;
pub mod codec;
pub mod error;
pub mod framer;
pub mod memtier;
pub mod mtf;
pub mod packet;
pub mod slots;
pub mod template;
pub mod varint;

pub use codec::{
    decode, decode_container, decode_rows, encode, encode_to_container, pack_container,
    unpack_container, verify_roundtrip, Config, Mode, Packet,
};
pub use error::{Result, UscError};
