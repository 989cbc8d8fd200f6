// Fixed 256-entry Buzhash table, part of the chunk-boundary format.
// Generated once via a seeded splitmix64 stream; values are frozen —
// regenerating them would shift chunk boundaries for all existing data.
pub(crate) static BUZHASH_TABLE: [u32; 256] = [
    0xa1b965f4, 0x8009454f, 0x724c81ec, 0x51a8749b,
    0x747ea2ea, 0x1f4532e1, 0xc916ab3c, 0x41c98ac3,
    0x368cb0a6, 0x3cb13d09, 0x055bdef6, 0xe0bbdb7b,
    0x983aa92f, 0x00cc4d19, 0x971d80ab, 0x75521255,
    0x2b7f7f86, 0x83914f64, 0x5a4485ac, 0x100b9ed7,
    0x1825f10d, 0x0dca2f6a, 0x7bd2634c, 0xf5407269,
    0xdb4c4f7b, 0x92233300, 0x7de1d510, 0xb45c6316,
    0x0f4d3872, 0x72f3454f, 0xa8e40225, 0x4963bab0,
    0x111ac529, 0x599dc6f7, 0x93d108c3, 0x81daa383,
    0xb43343a1, 0xcbe531df, 0x24851729, 0xa792922a,
    0x918175ce, 0x302278a8, 0x7019e937, 0x52ebf438,
    0x0a691e37, 0x763e79ad, 0x743aae49, 0xb1a1f2e1,
    0x4f4f52da, 0xa71a5eb1, 0xb6513356, 0xd4367d77,
    0x23ce3c71, 0x0043c714, 0x844f1705, 0xdd9e0ec1,
    0x82bb9698, 0xcbc87656, 0xa17b3c8f, 0x1d5c5d7b,
    0x1cbbf170, 0x29a88f1d, 0xb8bb18fb, 0x6c6ad50e,
    0x3e46f143, 0x99a4fc72, 0x8a8bb259, 0xaed5bdfc,
    0x8d8553c0, 0x8c4064c0, 0x1d86a66f, 0x03c367a8,
    0x1ec11786, 0xee954551, 0x0555c6df, 0x72403c08,
    0x1bfa1137, 0xb5c554e1, 0x7441bcd2, 0xb48216e8,
    0x40bf0048, 0xa0ee15b4, 0x96a7eea1, 0x98f8a0fd,
    0x0e3335a7, 0xebcb1cca, 0x7453424e, 0x05234c6d,
    0xa6f2b568, 0x39ac2c65, 0x14d23c6f, 0x57e00235,
    0xc6589373, 0x6dd3aee7, 0xc376cc66, 0x897b2307,
    0x6343e5c3, 0x9eba2304, 0x6bd1a506, 0x00a05f50,
    0x0385cdbc, 0xd78101da, 0x6ca266ac, 0xbb2dc749,
    0x8493cd8c, 0x336bd182, 0x3741519b, 0xb109ac94,
    0x813cb177, 0x0f7c9370, 0xcde95015, 0xfb354461,
    0x64ed82f2, 0x41ce6808, 0xc9643c37, 0xa70fa9c0,
    0xa4005729, 0x927b52d8, 0x42f6791f, 0xcab4adae,
    0xc5ab61d6, 0x79d452d9, 0x0085641c, 0x157c85d0,
    0x4e08f3a3, 0x06c41fc2, 0x45a39c19, 0xd20f0841,
    0x57e774b8, 0xaf5b0cc3, 0xa23864a4, 0xa1d0f7bd,
    0x3349f8e4, 0x86039fe8, 0xd953eff2, 0x650d04e1,
    0x46980cad, 0x5299106c, 0x1adea7cd, 0xf04895b4,
    0x3f62c0e0, 0xf4ecf37f, 0xa352437f, 0xc34d6363,
    0x0786cf50, 0x0e6c9d8a, 0x776e37e1, 0x6ba7eee8,
    0xe9660c62, 0x116b5e0b, 0x0f6a3645, 0xbd82131b,
    0xd319aec0, 0x553d320b, 0x47612dcf, 0x7c0a77f5,
    0x381ec437, 0xa24494ae, 0xcdc895a9, 0x586d7a91,
    0xc2f49745, 0x2acbd1f0, 0x47c1c8e1, 0x7d015bf6,
    0x7511b6a9, 0x2e89a193, 0x498d8347, 0x123d6faa,
    0x102301eb, 0x17a43c52, 0x1355ef2d, 0xfdee7cfc,
    0x86e29eed, 0x64517f89, 0xe8a6849d, 0x2e8f9cb0,
    0xef54f7c3, 0xaac3a919, 0xacf748a0, 0x3b1e1b78,
    0x0df9faee, 0x796893ba, 0x2070e652, 0x97a12dcc,
    0x75704f28, 0x70a924fb, 0x1bfc419c, 0x52b85c1f,
    0x6211cc67, 0x1db57ff0, 0xa1a8e901, 0x5ada36da,
    0xb42e37d4, 0x91d6a7d1, 0xa357f38e, 0x09e447f0,
    0x25215be0, 0x1e33c095, 0x533e80ac, 0xe8301d95,
    0x83d9ba21, 0x3b0e7d2e, 0x3a8a8d6c, 0xa7cbf6bd,
    0xc4e2a6a7, 0xd50577a9, 0xb539087d, 0x552b4f57,
    0x0a8a8898, 0x7fb54b19, 0xe50ef3ef, 0xe2efd65c,
    0x9785f572, 0xf2b0f37a, 0x3b343439, 0x212e37e8,
    0xd4fc75ed, 0x9697108e, 0x5db69bee, 0x41daf445,
    0x1e81a5fc, 0xe77de273, 0x5e06513a, 0x02987cab,
    0x6a4e55a8, 0xf39acdd4, 0x8170cde1, 0x7e1854c9,
    0xd55df899, 0xf1067032, 0xce60fab0, 0x286d18b1,
    0xb85ed6d8, 0xe3acc5a3, 0x42cea639, 0x1d904827,
    0xbd9cdee5, 0x7ffbb613, 0x79963d1b, 0x6cc24920,
    0xc57169fb, 0xfeb62d07, 0xc88469f4, 0xe68dfee4,
    0x2a105536, 0x3aefc159, 0x9df63ee2, 0x76cc6044,
    0x226c6ab6, 0x07bdfdab, 0x8e0d2933, 0xba00b9cc,
    0xf0003ee8, 0xa75fb9be, 0x47bcf19e, 0xb7c7534d,
];
